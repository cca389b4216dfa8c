// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Proxy chain negotiation state machine.
//!
//! A [ChainContext] tracks one connection's progress through its
//! proxy chain.  Every event the reactor delivers for that connection
//! goes through [dispatch], which hands it to the protocol of the
//! current hop and acts on the [NegotiationOutcome]:
//!
//! * `Continue`: return to the reactor and wait for the next event.
//!
//! * `Advance`: move to the next hop and immediately start its
//!   negotiation with the same event.
//!
//! * `Forward`: the whole chain is open; release the application's
//!   pending event.
//!
//! * `Fail`: release the pending event with
//!   [ProxyError](EventStatus::ProxyError) status.
//!
//! Each call to [dispatch] releases at most one event, and releases
//! it exactly once.
use std::fmt::Display;
use std::fmt::Formatter;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;

#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::trace;
#[cfg(feature = "log")]
use log::warn;

use crate::error::ProxyError;
use crate::event::EventStatus;
use crate::event::EventType;
use crate::event::ForwardGate;
use crate::event::ProxyEvent;
use crate::event::Reactor;
use crate::node::release_nodes;
use crate::node::ProxyChain;
use crate::node::ProxyNode;
use crate::protocol::NegotiationOutcome;
use crate::protocol::ProxyProtocol;
use crate::protocol::ProxyType;

/// Negotiation state of the current hop.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum NegotiationState {
    /// About to send the current hop's request.
    Initial,
    /// Request sent, awaiting the hop's response.
    HopConnected,
    /// Current hop confirmed.
    TunnelEstablished
}

/// What [dispatch] did with an event.
#[derive(Debug)]
pub enum Dispatched {
    /// Negotiation continues; nothing was released.
    Pending,
    /// The chain is open and the event was released.
    Established,
    /// The underlying I/O failed during negotiation; the event was
    /// released with its original status.
    Interrupted,
    /// Negotiation failed; the event was released with
    /// [ProxyError](EventStatus::ProxyError) status.
    Failed(ProxyError),
    /// Negotiation had already failed; the event was a leftover
    /// negotiation completion and was dropped.
    Discarded
}

/// Per-connection proxy chain state.
///
/// The hop cursor only moves forward.  It starts at the first hop
/// and ends one past the last hop, at which point the chain is
/// exhausted and the target is reached.
pub struct ChainContext {
    /// Hops, first hop first.
    nodes: Vec<ProxyNode>,
    /// Index of the hop being negotiated.
    cursor: usize,
    /// Final target.
    target: SocketAddr,
    /// Deadline for the whole negotiation.
    deadline: Instant,
    /// Negotiation state of the current hop.
    state: NegotiationState
}

impl ChainContext {
    /// Create a context negotiating `chain` to reach `target` before
    /// `deadline`.
    pub fn new(
        chain: ProxyChain,
        target: SocketAddr,
        deadline: Instant
    ) -> ChainContext {
        ChainContext {
            nodes: chain.take_nodes(),
            cursor: 0,
            target: target,
            deadline: deadline,
            state: NegotiationState::Initial
        }
    }

    /// Get the hops, first hop first.
    #[inline]
    pub fn nodes(&self) -> &[ProxyNode] {
        &self.nodes
    }

    /// Get the index of the hop being negotiated.
    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Check whether every hop has been negotiated.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.nodes.len()
    }

    /// Check whether the tunnel is open all the way to the target.
    #[inline]
    pub fn is_established(&self) -> bool {
        self.is_exhausted() && self.state == NegotiationState::TunnelEstablished
    }

    /// Get the hop being negotiated.
    #[inline]
    pub fn current_node(&self) -> Option<&ProxyNode> {
        self.nodes.get(self.cursor)
    }

    /// Get the hop after the one being negotiated.
    #[inline]
    pub fn next_node(&self) -> Option<&ProxyNode> {
        self.nodes.get(self.cursor + 1)
    }

    /// Get the final target.
    #[inline]
    pub fn target(&self) -> &SocketAddr {
        &self.target
    }

    /// Get the negotiation deadline.
    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Get the time left until the deadline, as of `now`.
    #[inline]
    pub fn remaining(
        &self,
        now: Instant
    ) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// Get the negotiation state of the current hop.
    #[inline]
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Set the negotiation state of the current hop.
    ///
    /// This is for use by [ProxyProtocol] implementations.
    #[inline]
    pub fn set_state(
        &mut self,
        state: NegotiationState
    ) {
        #[cfg(feature = "log")]
        trace!(target: "proxy-chain",
               "hop {} state {} -> {}",
               self.cursor, self.state, state);

        self.state = state
    }

    /// Get the address the connection's socket must connect to.
    ///
    /// This is the first hop, or the target if there are none.
    #[inline]
    pub fn connect_addr(&self) -> SocketAddr {
        self.nodes
            .first()
            .map(|node| *node.addr())
            .unwrap_or(self.target)
    }

    /// Get the address the current hop must open a tunnel to.
    ///
    /// This is the next hop, or the target if the current hop is the
    /// last one.
    #[inline]
    pub fn next_endpoint(&self) -> SocketAddr {
        self.next_node()
            .map(|node| *node.addr())
            .unwrap_or(self.target)
    }

    /// Get a name for the current hop, for diagnostics.
    pub fn current_name(&self) -> String {
        match self.current_node() {
            Some(node) => String::from(node.name()),
            None => self.target.to_string()
        }
    }

    /// Get the protocol that negotiates the current hop.
    ///
    /// Once the chain is exhausted this is the last hop's protocol.
    /// A chain with no hops is negotiated as HTTP `CONNECT` directly
    /// with the target.
    pub fn protocol(&self) -> &'static dyn ProxyProtocol {
        self.nodes
            .get(self.cursor)
            .or_else(|| self.nodes.last())
            .map(|node| node.proxy_type())
            .unwrap_or(ProxyType::HTTP)
            .protocol()
    }

    /// Move past the current hop.
    fn advance(&mut self) {
        if !self.is_exhausted() {
            self.cursor += 1;
        }
    }
}

impl Drop for ChainContext {
    fn drop(&mut self) {
        release_nodes(&mut self.nodes)
    }
}

impl Display for NegotiationState {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            NegotiationState::Initial => write!(f, "initial"),
            NegotiationState::HopConnected => write!(f, "hop connected"),
            NegotiationState::TunnelEstablished => {
                write!(f, "tunnel established")
            }
        }
    }
}

/// Drive `ctx` with `event`, releasing it through `gate` once the
/// chain is open or has failed.
///
/// Events with any status other than success are passed to `gate`
/// untouched, except for a timeout while a hop's response is
/// awaited, which fails the negotiation.
///
/// # Panics
///
/// If a protocol reports a hop as done without establishing its
/// tunnel, or asks to advance past the last hop.
pub fn dispatch<G>(
    ctx: &mut ChainContext,
    mut event: ProxyEvent,
    reactor: &mut dyn Reactor,
    gate: &mut G,
    now: Instant
) -> Dispatched
where
    G: ForwardGate + ?Sized {
    let established = ctx.is_established();
    let status = event.status();

    if !status.is_success() &&
        !(status == EventStatus::Timeout &&
            ctx.state() == NegotiationState::HopConnected)
    {
        #[cfg(feature = "log")]
        debug!(target: "proxy-chain",
               "passing {} event with status {} through",
               event.ty(), status);

        if established {
            gate.forward(event);

            return Dispatched::Established;
        } else {
            event.retarget(EventType::Connect);
            gate.forward(event);

            return Dispatched::Interrupted;
        }
    }

    loop {
        let protocol = ctx.protocol();

        match protocol.handle(ctx, &event, reactor, now) {
            NegotiationOutcome::Continue => return Dispatched::Pending,
            NegotiationOutcome::Advance => {
                if ctx.state() != NegotiationState::TunnelEstablished ||
                    ctx.next_node().is_none()
                {
                    panic!(
                        "{} protocol advanced from hop {} in state {}",
                        protocol.proxy_type(),
                        ctx.cursor(),
                        ctx.state()
                    )
                }

                #[cfg(feature = "log")]
                debug!(target: "proxy-chain",
                       "tunnel open through {}, negotiating next hop",
                       ctx.current_name());

                ctx.advance();
                ctx.set_state(NegotiationState::Initial);
            }
            NegotiationOutcome::Forward => {
                if ctx.state() != NegotiationState::TunnelEstablished {
                    panic!(
                        "{} protocol forwarded from hop {} in state {}",
                        protocol.proxy_type(),
                        ctx.cursor(),
                        ctx.state()
                    )
                }

                if !established {
                    #[cfg(feature = "log")]
                    debug!(target: "proxy-chain",
                           "tunnel open through {} to {}",
                           ctx.current_name(), ctx.target());

                    ctx.advance();
                    event.retarget(EventType::Connect);
                }

                gate.forward(event);

                return Dispatched::Established;
            }
            NegotiationOutcome::Fail(error) => {
                #[cfg(feature = "log")]
                warn!(target: "proxy-chain",
                      "proxy negotiation failed at {} ({})",
                      ctx.current_name(), error);

                event.retarget(EventType::Connect);
                event.set_status(EventStatus::ProxyError);
                gate.forward(event);

                return Dispatched::Failed(error);
            }
        }
    }
}

#[cfg(test)]
use std::io::ErrorKind;

#[cfg(test)]
use crate::event::RecordingReactor;
#[cfg(test)]
use crate::event::Request;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::resolve::StaticResolver;

#[cfg(test)]
const TARGET: &str = "192.0.2.7:443";

#[cfg(test)]
fn chain_context(
    hops: &[&str],
    deadline: Instant
) -> ChainContext {
    let resolver = StaticResolver::default()
        .with("hop1-host", "10.0.0.1")
        .with("hop2-host", "10.0.0.2")
        .with("hop3-host", "10.0.0.3")
        .with("hop4-host", "10.0.0.4");
    let chain =
        ProxyChain::from_uris(hops, &resolver).expect("Expected success");

    ChainContext::new(chain, TARGET.parse().unwrap(), deadline)
}

#[cfg(test)]
fn hops(n: usize) -> Vec<String> {
    (1..=n)
        .map(|i| format!("http://hop{}-host:{}", i, 3000 + i))
        .collect()
}

/// Run a chain to completion, answering hop `i` with `responses[i]`.
#[cfg(test)]
fn run_chain(
    ctx: &mut ChainContext,
    responses: &[&[u8]],
    reactor: &mut RecordingReactor,
    now: Instant
) -> (Vec<ProxyEvent>, Dispatched) {
    let mut released = Vec::new();
    let mut res = dispatch(
        ctx,
        ProxyEvent::connected(),
        reactor,
        &mut |event: ProxyEvent| released.push(event),
        now
    );

    for response in responses {
        match res {
            Dispatched::Pending => {}
            _ => break
        }

        res = dispatch(
            ctx,
            ProxyEvent::written(),
            reactor,
            &mut |event: ProxyEvent| released.push(event),
            now
        );

        match res {
            Dispatched::Pending => {}
            _ => panic!("Write completion should not release")
        }

        res = dispatch(
            ctx,
            ProxyEvent::read(response.to_vec()),
            reactor,
            &mut |event: ProxyEvent| released.push(event),
            now
        );
    }

    (released, res)
}

#[test]
fn test_single_hop_success() {
    init();

    let now = Instant::now();
    let mut ctx =
        chain_context(&["http://hop1-host:3128"], now + Duration::from_secs(5));
    let mut reactor = RecordingReactor::default();
    let (released, res) = run_chain(
        &mut ctx,
        &[b"HTTP/1.1 200 OK\r\n"],
        &mut reactor,
        now
    );

    match res {
        Dispatched::Established => {}
        res => panic!("Expected established, got {:?}", res)
    }

    assert_eq!(released.len(), 1);
    assert_eq!(released[0].ty(), EventType::Connect);
    assert_eq!(released[0].status(), EventStatus::Success);
    assert!(released[0].read_buf().is_empty());
    assert_eq!(ctx.cursor(), 1);
    assert!(ctx.is_established());
    assert!(ctx.current_node().is_none());
    assert_eq!(
        reactor.requests,
        vec![
            Request::Write {
                timeout: Duration::from_secs(5),
                data: b"CONNECT 192.0.2.7:443 HTTP/1.1\r\n\r\n".to_vec()
            },
            Request::ReadLines {
                timeout: Duration::from_secs(5),
                nlines: 1
            },
        ]
    );
}

#[test]
fn test_two_hop_second_refused() {
    init();

    let now = Instant::now();
    let mut ctx = chain_context(
        &["http://hop1-host:3128", "http://hop2-host:8888"],
        now + Duration::from_secs(5)
    );
    let mut reactor = RecordingReactor::default();
    let (released, res) = run_chain(
        &mut ctx,
        &[b"HTTP/1.1 200 OK\r\n", b"HTTP/1.1 403 Forbidden\r\n"],
        &mut reactor,
        now
    );

    match res {
        Dispatched::Failed(ProxyError::TunnelRefused { node, response }) => {
            assert_eq!(node, "http://hop2-host:8888");
            assert_eq!(response, "HTTP/1.1 403 Forbidden");
        }
        res => panic!("Expected tunnel refused, got {:?}", res)
    }

    assert_eq!(released.len(), 1);
    assert_eq!(released[0].ty(), EventType::Connect);
    assert_eq!(released[0].status(), EventStatus::ProxyError);
    assert_eq!(ctx.cursor(), 1);
    assert_eq!(
        reactor.take_writes(),
        vec![
            String::from("CONNECT 10.0.0.2:8888 HTTP/1.1\r\n\r\n"),
            String::from("CONNECT 192.0.2.7:443 HTTP/1.1\r\n\r\n"),
        ]
    );
}

#[test]
fn test_zero_hop_direct() {
    init();

    let now = Instant::now();
    let mut ctx = chain_context(&[], now + Duration::from_secs(5));
    let mut reactor = RecordingReactor::default();

    assert!(ctx.is_exhausted());
    assert_eq!(ctx.connect_addr(), TARGET.parse().unwrap());

    let (released, res) = run_chain(
        &mut ctx,
        &[b"HTTP/1.0 200 OK\r\n"],
        &mut reactor,
        now
    );

    match res {
        Dispatched::Established => {}
        res => panic!("Expected established, got {:?}", res)
    }

    assert_eq!(released.len(), 1);
    assert_eq!(released[0].status(), EventStatus::Success);
    assert_eq!(ctx.cursor(), 0);
    assert_eq!(
        reactor.take_writes(),
        vec![String::from("CONNECT 192.0.2.7:443 HTTP/1.1\r\n\r\n")]
    );
}

#[test]
fn test_chain_success_advances_per_hop() {
    init();

    for n in 0..5 {
        let now = Instant::now();
        let uris = hops(n);
        let uris: Vec<&str> = uris.iter().map(String::as_str).collect();
        let mut ctx = chain_context(&uris, now + Duration::from_secs(5));
        let mut reactor = RecordingReactor::default();
        let responses: Vec<&[u8]> =
            vec![&b"HTTP/1.1 200 OK\r\n"[..]; n.max(1)];
        let (released, res) =
            run_chain(&mut ctx, &responses, &mut reactor, now);

        match res {
            Dispatched::Established => {}
            res => panic!("Expected established for {} hops, got {:?}", n, res)
        }

        assert_eq!(released.len(), 1);
        assert_eq!(released[0].status(), EventStatus::Success);
        assert_eq!(ctx.cursor(), n);
        assert!(ctx.is_established());

        let writes = reactor.take_writes();

        assert_eq!(writes.len(), n.max(1));

        // Each hop is asked for the hop after it.
        for (i, write) in writes.iter().take(n.saturating_sub(1)).enumerate() {
            assert_eq!(
                write,
                &format!(
                    "CONNECT 10.0.0.{}:{} HTTP/1.1\r\n\r\n",
                    i + 2,
                    3002 + i
                )
            );
        }

        assert_eq!(
            writes.last().unwrap(),
            "CONNECT 192.0.2.7:443 HTTP/1.1\r\n\r\n"
        );
    }
}

#[test]
fn test_chain_failure_stops_at_hop() {
    init();

    let n = 4;

    for k in 1..=n {
        let now = Instant::now();
        let uris = hops(n);
        let uris: Vec<&str> = uris.iter().map(String::as_str).collect();
        let mut ctx = chain_context(&uris, now + Duration::from_secs(5));
        let mut reactor = RecordingReactor::default();
        let mut responses: Vec<&[u8]> = vec![&b"HTTP/1.1 200 OK\r\n"[..]; k - 1];

        responses.push(b"HTTP/1.1 407 Proxy Authentication Required\r\n");

        let (released, res) =
            run_chain(&mut ctx, &responses, &mut reactor, now);

        match res {
            Dispatched::Failed(ProxyError::TunnelRefused { node, .. }) => {
                assert_eq!(node, format!("http://hop{}-host:{}", k, 3000 + k))
            }
            res => panic!("Expected tunnel refused at {}, got {:?}", k, res)
        }

        assert_eq!(released.len(), 1);
        assert_eq!(released[0].status(), EventStatus::ProxyError);
        assert_eq!(ctx.cursor(), k - 1);
        assert_eq!(reactor.take_writes().len(), k);
    }
}

#[test]
fn test_response_timeout_fails() {
    init();

    let now = Instant::now();
    let mut ctx = chain_context(
        &["http://hop1-host:3128", "http://hop2-host:3128"],
        now + Duration::from_secs(5)
    );
    let mut reactor = RecordingReactor::default();
    let mut released = Vec::new();
    let mut gate = |event: ProxyEvent| released.push(event);

    dispatch(&mut ctx, ProxyEvent::connected(), &mut reactor, &mut gate, now);

    match dispatch(
        &mut ctx,
        ProxyEvent::timeout(EventType::Read),
        &mut reactor,
        &mut gate,
        now + Duration::from_secs(5)
    ) {
        Dispatched::Failed(ProxyError::Timeout { node }) => {
            assert_eq!(node, "http://hop1-host:3128")
        }
        res => panic!("Expected timeout, got {:?}", res)
    }

    assert_eq!(released.len(), 1);
    assert_eq!(released[0].status(), EventStatus::ProxyError);
}

#[test]
fn test_remaining_budget_shrinks() {
    init();

    let start = Instant::now();
    let mut ctx = chain_context(
        &["http://hop1-host:3128", "http://hop2-host:3128"],
        start + Duration::from_secs(10)
    );
    let mut reactor = RecordingReactor::default();
    let mut released = Vec::new();
    let mut gate = |event: ProxyEvent| released.push(event);

    dispatch(
        &mut ctx,
        ProxyEvent::connected(),
        &mut reactor,
        &mut gate,
        start + Duration::from_secs(1)
    );
    dispatch(
        &mut ctx,
        ProxyEvent::read(b"HTTP/1.1 200 OK\r\n".to_vec()),
        &mut reactor,
        &mut gate,
        start + Duration::from_secs(4)
    );

    let timeouts: Vec<Duration> = reactor
        .requests
        .iter()
        .map(|req| match req {
            Request::Write { timeout, .. } => *timeout,
            Request::ReadLines { timeout, .. } => *timeout
        })
        .collect();

    assert_eq!(
        timeouts,
        vec![
            Duration::from_secs(9),
            Duration::from_secs(9),
            Duration::from_secs(6),
            Duration::from_secs(6),
        ]
    );
    assert!(released.is_empty());
}

#[test]
fn test_expired_deadline_fails() {
    init();

    let now = Instant::now();
    let mut ctx = chain_context(&["http://hop1-host:3128"], now);
    let mut reactor = RecordingReactor::default();
    let mut released = Vec::new();

    match dispatch(
        &mut ctx,
        ProxyEvent::connected(),
        &mut reactor,
        &mut |event: ProxyEvent| released.push(event),
        now + Duration::from_millis(1)
    ) {
        Dispatched::Failed(ProxyError::Timeout { .. }) => {}
        res => panic!("Expected timeout, got {:?}", res)
    }

    assert!(reactor.requests.is_empty());
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].status(), EventStatus::ProxyError);
}

#[test]
fn test_io_error_interrupts() {
    init();

    let now = Instant::now();
    let mut ctx =
        chain_context(&["http://hop1-host:3128"], now + Duration::from_secs(5));
    let mut reactor = RecordingReactor::default();
    let mut released = Vec::new();
    let mut gate = |event: ProxyEvent| released.push(event);

    dispatch(&mut ctx, ProxyEvent::connected(), &mut reactor, &mut gate, now);

    let err = ProxyEvent::new(
        EventType::Read,
        EventStatus::Error {
            kind: ErrorKind::ConnectionReset
        }
    );

    match dispatch(&mut ctx, err, &mut reactor, &mut gate, now) {
        Dispatched::Interrupted => {}
        res => panic!("Expected interrupted, got {:?}", res)
    }

    assert_eq!(released.len(), 1);
    assert_eq!(released[0].ty(), EventType::Connect);
    assert_eq!(
        released[0].status(),
        EventStatus::Error {
            kind: ErrorKind::ConnectionReset
        }
    );
}

#[test]
fn test_established_passes_events_through() {
    init();

    let now = Instant::now();
    let mut ctx =
        chain_context(&["http://hop1-host:3128"], now + Duration::from_secs(5));
    let mut reactor = RecordingReactor::default();
    let (released, _) =
        run_chain(&mut ctx, &[b"HTTP/1.1 200 OK\r\n"], &mut reactor, now);

    assert_eq!(released.len(), 1);
    reactor.requests.clear();

    let mut later = Vec::new();
    let mut gate = |event: ProxyEvent| later.push(event);

    for event in vec![
        ProxyEvent::read(b"payload".to_vec()),
        ProxyEvent::written(),
        ProxyEvent::new(EventType::Read, EventStatus::EOF),
    ] {
        match dispatch(&mut ctx, event, &mut reactor, &mut gate, now) {
            Dispatched::Established => {}
            res => panic!("Expected established, got {:?}", res)
        }
    }

    assert!(reactor.requests.is_empty());
    assert_eq!(later.len(), 3);
    assert_eq!(later[0].ty(), EventType::Read);
    assert_eq!(later[0].read_buf(), b"payload");
    assert_eq!(later[1].ty(), EventType::Write);
    assert_eq!(later[2].status(), EventStatus::EOF);
    assert_eq!(ctx.cursor(), 1);
}

#[test]
fn test_connect_addr_first_hop() {
    let now = Instant::now();
    let ctx = chain_context(
        &["http://hop1-host:3128", "http://hop2-host:3129"],
        now
    );

    assert_eq!(ctx.connect_addr(), "10.0.0.1:3128".parse().unwrap());
    assert_eq!(ctx.next_endpoint(), "10.0.0.2:3129".parse().unwrap());
    assert_eq!(ctx.current_name(), "http://hop1-host:3128");
    assert_eq!(ctx.state(), NegotiationState::Initial);
}
