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

//! Connections that may go through a proxy chain.
//!
//! A [ProxyConnection] sits between the reactor and the
//! application's handler for one connection.  While its
//! [ChainContext] is still negotiating, events go to
//! [dispatch]; once negotiation succeeds (or if there never was a
//! chain), events go straight to the handler.  Once negotiation
//! fails, any completions still outstanding from it are dropped.
use std::net::SocketAddr;
use std::time::Instant;

#[cfg(feature = "log")]
use log::debug;

use crate::event::ForwardGate;
use crate::event::ProxyEvent;
use crate::event::Reactor;
use crate::state::dispatch;
use crate::state::ChainContext;
use crate::state::Dispatched;

/// A connection and its optional proxy chain.
pub struct ProxyConnection<H: ForwardGate> {
    /// Address the socket must connect to.
    connect_addr: SocketAddr,
    /// Proxy chain state, dropped when negotiation fails.
    ctx: Option<ChainContext>,
    /// Whether negotiation failed.
    failed: bool,
    /// Application handler.
    handler: H
}

impl<H> ProxyConnection<H>
where
    H: ForwardGate
{
    /// Create a connection straight to `target`.
    #[inline]
    pub fn direct(
        target: SocketAddr,
        handler: H
    ) -> ProxyConnection<H> {
        ProxyConnection {
            connect_addr: target,
            ctx: None,
            failed: false,
            handler: handler
        }
    }

    /// Create a connection negotiated through `ctx`.
    #[inline]
    pub fn chained(
        ctx: ChainContext,
        handler: H
    ) -> ProxyConnection<H> {
        ProxyConnection {
            connect_addr: ctx.connect_addr(),
            ctx: Some(ctx),
            failed: false,
            handler: handler
        }
    }

    /// Get the address the reactor must connect the socket to.
    #[inline]
    pub fn connect_addr(&self) -> SocketAddr {
        self.connect_addr
    }

    /// Get the proxy chain state, if negotiation has not failed.
    #[inline]
    pub fn context(&self) -> Option<&ChainContext> {
        self.ctx.as_ref()
    }

    /// Check whether proxy negotiation is still in progress.
    #[inline]
    pub fn is_negotiating(&self) -> bool {
        self.ctx.as_ref().map_or(false, |ctx| !ctx.is_established())
    }

    /// Check whether proxy negotiation failed.
    ///
    /// A failed connection never delivers another event to the
    /// application handler.
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Get the application handler.
    #[inline]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Get the application handler mutably.
    #[inline]
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Close the connection, releasing the proxy chain, and get back
    /// the application handler.
    #[inline]
    pub fn close(self) -> H {
        self.handler
    }

    /// Handle an event from the reactor.
    ///
    /// The event reaches the application handler exactly once, unless
    /// proxy negotiation consumes it or has already failed.
    pub fn handle_event(
        &mut self,
        event: ProxyEvent,
        reactor: &mut dyn Reactor,
        now: Instant
    ) -> Dispatched {
        if self.failed {
            #[cfg(feature = "log")]
            debug!(target: "proxy-chain",
                   "dropping {} event ({}) after failed negotiation",
                   event.ty(), event.status());

            return Dispatched::Discarded;
        }

        let res = match &mut self.ctx {
            Some(ctx) => dispatch(ctx, event, reactor, &mut self.handler, now),
            None => {
                self.handler.forward(event);

                return Dispatched::Established;
            }
        };

        match res {
            Dispatched::Failed(_) | Dispatched::Interrupted => {
                #[cfg(feature = "log")]
                debug!(target: "proxy-chain",
                       "releasing proxy chain after failed negotiation");

                self.ctx = None;
                self.failed = true;
            }
            Dispatched::Pending |
            Dispatched::Established |
            Dispatched::Discarded => {}
        }

        res
    }
}

#[cfg(test)]
use std::io::ErrorKind;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use crate::error::ProxyError;
#[cfg(test)]
use crate::event::EventStatus;
#[cfg(test)]
use crate::event::EventType;
#[cfg(test)]
use crate::event::RecordingReactor;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::params::ProxyChainParams;
#[cfg(test)]
use crate::resolve::StaticResolver;

/// Application handler that keeps every event it is given.
#[cfg(test)]
#[derive(Default)]
struct Collect {
    events: Vec<ProxyEvent>
}

#[cfg(test)]
impl ForwardGate for Collect {
    fn forward(
        &mut self,
        event: ProxyEvent
    ) {
        self.events.push(event)
    }
}

#[cfg(test)]
fn connection(
    chain: &str,
    now: Instant
) -> ProxyConnection<Collect> {
    let resolver = StaticResolver::default()
        .with("hop1-host", "10.0.0.1")
        .with("hop2-host", "10.0.0.2");
    let params =
        ProxyChainParams::from_chain_str(chain, Duration::from_secs(10));
    let ctx = params
        .context(&resolver, "192.0.2.7:443".parse().unwrap(), now)
        .expect("Expected success");

    ProxyConnection::chained(ctx, Collect::default())
}

#[test]
fn test_direct_forwards_everything() {
    let now = Instant::now();
    let mut conn = ProxyConnection::direct(
        "192.0.2.7:443".parse().unwrap(),
        Collect::default()
    );
    let mut reactor = RecordingReactor::default();

    assert!(!conn.is_negotiating());
    assert_eq!(conn.connect_addr(), "192.0.2.7:443".parse().unwrap());

    conn.handle_event(ProxyEvent::connected(), &mut reactor, now);
    conn.handle_event(ProxyEvent::read(b"data".to_vec()), &mut reactor, now);

    assert!(reactor.requests.is_empty());
    assert_eq!(conn.handler().events.len(), 2);
    assert_eq!(conn.handler().events[1].read_buf(), b"data");
}

#[test]
fn test_single_hop_established() {
    init();

    let now = Instant::now();
    let mut conn = connection("http://hop1-host:3128", now);
    let mut reactor = RecordingReactor::default();

    assert_eq!(conn.connect_addr(), "10.0.0.1:3128".parse().unwrap());
    assert!(conn.is_negotiating());

    conn.handle_event(ProxyEvent::connected(), &mut reactor, now);
    conn.handle_event(ProxyEvent::written(), &mut reactor, now);

    assert!(conn.handler().events.is_empty());

    match conn.handle_event(
        ProxyEvent::read(b"HTTP/1.1 200 OK\r\n".to_vec()),
        &mut reactor,
        now
    ) {
        Dispatched::Established => {}
        res => panic!("Expected established, got {:?}", res)
    }

    assert!(!conn.is_negotiating());
    assert_eq!(conn.handler().events.len(), 1);
    assert_eq!(conn.handler().events[0].ty(), EventType::Connect);
    assert_eq!(conn.handler().events[0].status(), EventStatus::Success);

    // Application traffic now passes straight through.
    conn.handle_event(ProxyEvent::read(b"data".to_vec()), &mut reactor, now);

    let events = conn.close().events;

    assert_eq!(events.len(), 2);
    assert_eq!(events[1].read_buf(), b"data");
}

#[test]
fn test_second_hop_refused_tears_down() {
    init();

    let now = Instant::now();
    let mut conn = connection("http://hop1-host:3128,http://hop2-host", now);
    let mut reactor = RecordingReactor::default();

    conn.handle_event(ProxyEvent::connected(), &mut reactor, now);
    conn.handle_event(
        ProxyEvent::read(b"HTTP/1.1 200 OK\r\n".to_vec()),
        &mut reactor,
        now
    );

    assert_eq!(conn.context().map(|ctx| ctx.cursor()), Some(1));

    match conn.handle_event(
        ProxyEvent::read(b"HTTP/1.1 403 Forbidden\r\n".to_vec()),
        &mut reactor,
        now
    ) {
        Dispatched::Failed(ProxyError::TunnelRefused { node, .. }) => {
            assert_eq!(node, "http://hop2-host:8080")
        }
        res => panic!("Expected tunnel refused, got {:?}", res)
    }

    assert!(conn.context().is_none());
    assert!(!conn.is_negotiating());
    assert_eq!(conn.handler().events.len(), 1);
    assert_eq!(conn.handler().events[0].status(), EventStatus::ProxyError);
}

#[test]
fn test_timeout_tears_down() {
    init();

    let now = Instant::now();
    let mut conn = connection("http://hop1-host:3128", now);
    let mut reactor = RecordingReactor::default();

    conn.handle_event(ProxyEvent::connected(), &mut reactor, now);

    match conn.handle_event(
        ProxyEvent::timeout(EventType::Read),
        &mut reactor,
        now + Duration::from_secs(10)
    ) {
        Dispatched::Failed(ProxyError::Timeout { .. }) => {}
        res => panic!("Expected timeout, got {:?}", res)
    }

    assert!(conn.context().is_none());
    assert_eq!(conn.handler().events.len(), 1);
    assert_eq!(conn.handler().events[0].status(), EventStatus::ProxyError);
}

#[test]
fn test_write_error_drops_late_response() {
    init();

    let now = Instant::now();
    let mut conn = connection("http://hop1-host:3128", now);
    let mut reactor = RecordingReactor::default();

    conn.handle_event(ProxyEvent::connected(), &mut reactor, now);

    let broken = ProxyEvent::new(
        EventType::Write,
        EventStatus::Error {
            kind: ErrorKind::BrokenPipe
        }
    );

    match conn.handle_event(broken, &mut reactor, now) {
        Dispatched::Interrupted => {}
        res => panic!("Expected interrupted, got {:?}", res)
    }

    assert!(conn.is_failed());
    assert!(!conn.is_negotiating());

    // The proxy's answer to the CONNECT already sent still arrives.
    match conn.handle_event(
        ProxyEvent::read(b"HTTP/1.1 200 OK\r\n".to_vec()),
        &mut reactor,
        now
    ) {
        Dispatched::Discarded => {}
        res => panic!("Expected discarded, got {:?}", res)
    }

    match conn.handle_event(
        ProxyEvent::new(EventType::Read, EventStatus::EOF),
        &mut reactor,
        now
    ) {
        Dispatched::Discarded => {}
        res => panic!("Expected discarded, got {:?}", res)
    }

    let events = conn.close().events;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].ty(), EventType::Connect);
    assert_eq!(
        events[0].status(),
        EventStatus::Error {
            kind: ErrorKind::BrokenPipe
        }
    );
}

#[test]
fn test_refused_drops_late_events() {
    init();

    let now = Instant::now();
    let mut conn = connection("http://hop1-host:3128", now);
    let mut reactor = RecordingReactor::default();

    conn.handle_event(ProxyEvent::connected(), &mut reactor, now);
    conn.handle_event(
        ProxyEvent::read(b"HTTP/1.1 403 Forbidden\r\n".to_vec()),
        &mut reactor,
        now
    );

    assert!(conn.is_failed());

    match conn.handle_event(
        ProxyEvent::read(b"leftover".to_vec()),
        &mut reactor,
        now
    ) {
        Dispatched::Discarded => {}
        res => panic!("Expected discarded, got {:?}", res)
    }

    assert_eq!(conn.handler().events.len(), 1);
    assert_eq!(conn.handler().events[0].status(), EventStatus::ProxyError);
}
