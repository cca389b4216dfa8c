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

//! HTTP `CONNECT` proxy protocol.
//!
//! Each hop is sent a bare `CONNECT host:port HTTP/1.1` request for
//! the next hop (or the target), and a single response line is read
//! back.
use std::net::SocketAddr;
use std::time::Instant;

use http::Uri;
#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::trace;

use crate::error::ProxyError;
use crate::event::EventStatus;
use crate::event::EventType;
use crate::event::ProxyEvent;
use crate::event::Reactor;
use crate::node::ProxyNode;
use crate::protocol::NegotiationOutcome;
use crate::protocol::ProxyProtocol;
use crate::protocol::ProxyType;
use crate::resolve::Resolve;
use crate::state::ChainContext;
use crate::state::NegotiationState;

/// Port used when a proxy URI has none.
pub const DEFAULT_PORT: u16 = 8080;

/// Shortest response that can be a success.
const MIN_RESPONSE_LEN: usize = 15;

/// Marker searched for in the response.
const SUCCESS_MARKER: &[u8] = b"200 OK";

/// HTTP `CONNECT` [ProxyProtocol] instance.
#[derive(Clone, Copy, Debug, Default)]
pub struct HTTPConnect;

/// Format the `CONNECT` request for `endpoint`.
#[inline]
fn connect_request(endpoint: &SocketAddr) -> String {
    format!(
        "CONNECT {}:{} HTTP/1.1\r\n\r\n",
        endpoint.ip(),
        endpoint.port()
    )
}

/// Check whether `response` accepts the tunnel.
///
/// This only looks for `"200 OK"` anywhere in a response of at least
/// 15 bytes; it does not parse the status line.
#[inline]
pub fn response_ok(response: &[u8]) -> bool {
    response.len() >= MIN_RESPONSE_LEN &&
        response
            .windows(SUCCESS_MARKER.len())
            .any(|window| window == SUCCESS_MARKER)
}

impl HTTPConnect {
    /// Send the request for the current hop and wait for its reply.
    fn handle_initial(
        &self,
        ctx: &mut ChainContext,
        reactor: &mut dyn Reactor,
        now: Instant
    ) -> NegotiationOutcome {
        let timeout = ctx.remaining(now);

        if timeout.is_zero() {
            return NegotiationOutcome::Fail(ProxyError::Timeout {
                node: ctx.current_name()
            });
        }

        ctx.set_state(NegotiationState::HopConnected);

        let request = connect_request(&ctx.next_endpoint());

        #[cfg(feature = "log")]
        trace!(target: "http-connect",
               "sending {:?} to {}",
               request, ctx.current_name());

        reactor.write(timeout, request.as_bytes());
        reactor.read_lines(timeout, 1);

        NegotiationOutcome::Continue
    }

    /// Check the hop's reply.
    fn handle_connected(
        &self,
        ctx: &mut ChainContext,
        event: &ProxyEvent
    ) -> NegotiationOutcome {
        if event.status() == EventStatus::Timeout {
            return NegotiationOutcome::Fail(ProxyError::Timeout {
                node: ctx.current_name()
            });
        }

        // Failed reads leave nothing buffered, and so are refused.
        let response = event.read_buf();

        if !response_ok(response) {
            let response = String::from_utf8_lossy(response);

            #[cfg(feature = "log")]
            debug!(target: "http-connect",
                   "connection refused from proxy {}",
                   ctx.current_name());

            return NegotiationOutcome::Fail(ProxyError::TunnelRefused {
                node: ctx.current_name(),
                response: String::from(response.trim_end())
            });
        }

        ctx.set_state(NegotiationState::TunnelEstablished);

        if ctx.next_node().is_some() {
            NegotiationOutcome::Advance
        } else {
            NegotiationOutcome::Forward
        }
    }
}

impl ProxyProtocol for HTTPConnect {
    #[inline]
    fn proxy_type(&self) -> ProxyType {
        ProxyType::HTTP
    }

    #[inline]
    fn prefix(&self) -> &'static str {
        "http://"
    }

    fn construct(
        &self,
        uri: &str,
        resolver: &dyn Resolve
    ) -> Result<ProxyNode, ProxyError> {
        let parsed: Uri = uri.parse().map_err(|err| ProxyError::BadURI {
            uri: String::from(uri),
            error: err
        })?;
        let host = parsed.host().ok_or_else(|| ProxyError::MissingHost {
            uri: String::from(uri)
        })?;
        let port = match parsed.port() {
            Some(port) => match port.as_str().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    return Err(ProxyError::BadPort {
                        uri: String::from(uri)
                    })
                }
            },
            None => DEFAULT_PORT
        };
        // IPv6 literals come back bracketed.
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        let addr = resolver.resolve(bare, port).map_err(|err| {
            ProxyError::ResolveError {
                host: String::from(bare),
                error: err
            }
        })?;
        let name = format!("http://{}:{}", host, port);

        #[cfg(feature = "log")]
        debug!(target: "http-connect",
               "created proxy node {} ({})",
               name, addr);

        Ok(ProxyNode::new(ProxyType::HTTP, addr, name))
    }

    fn destroy(
        &self,
        node: Option<ProxyNode>
    ) {
        if let Some(node) = node {
            #[cfg(feature = "log")]
            trace!(target: "http-connect",
                   "releasing proxy node {}",
                   node);

            drop(node)
        }
    }

    fn handle(
        &self,
        ctx: &mut ChainContext,
        event: &ProxyEvent,
        reactor: &mut dyn Reactor,
        now: Instant
    ) -> NegotiationOutcome {
        match ctx.state() {
            NegotiationState::Initial => self.handle_initial(ctx, reactor, now),
            // Only the response line matters; write completions are
            // ignored.
            NegotiationState::HopConnected => match event.ty() {
                EventType::Read => self.handle_connected(ctx, event),
                _ => NegotiationOutcome::Continue
            },
            NegotiationState::TunnelEstablished => NegotiationOutcome::Forward
        }
    }
}

#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use crate::event::RecordingReactor;
#[cfg(test)]
use crate::event::Request;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::node::ProxyChain;
#[cfg(test)]
use crate::resolve::StaticResolver;

#[cfg(test)]
fn resolver() -> StaticResolver {
    StaticResolver::default().with("proxy.example.com", "198.51.100.10")
}

#[cfg(test)]
fn single_hop(now: Instant) -> ChainContext {
    let chain = ProxyChain::from_uris(["http://proxy.example.com"], &resolver())
        .expect("Expected success");

    ChainContext::new(
        chain,
        "203.0.113.5:22".parse().unwrap(),
        now + Duration::from_secs(30)
    )
}

#[test]
fn test_construct_default_port() {
    init();

    let node = HTTPConnect
        .construct("http://proxy.example.com", &resolver())
        .expect("Expected success");

    assert_eq!(node.port(), DEFAULT_PORT);
    assert_eq!(node.addr(), &"198.51.100.10:8080".parse().unwrap());
    assert_eq!(node.name(), "http://proxy.example.com:8080");
    assert_eq!(node.proxy_type(), ProxyType::HTTP);
}

#[test]
fn test_construct_explicit_port() {
    init();

    for port in [1u16, 80, 3128, 65535].iter() {
        let uri = format!("http://proxy.example.com:{}/", port);
        let node = HTTPConnect
            .construct(&uri, &resolver())
            .expect("Expected success");

        assert_eq!(node.port(), *port);
        assert_eq!(node.name(), format!("http://proxy.example.com:{}", port));
    }
}

#[test]
fn test_construct_bad_port() {
    init();

    for uri in [
        "http://proxy.example.com:70000",
        "http://proxy.example.com:65536/",
        "http://proxy.example.com:0"
    ]
    .iter()
    {
        match HTTPConnect.construct(uri, &resolver()) {
            Err(ProxyError::BadPort { uri: bad }) => assert_eq!(&bad, uri),
            Err(err) => panic!("Expected bad port, got {}", err),
            Ok(node) => panic!("Expected bad port, got node {}", node)
        }
    }
}

#[test]
fn test_construct_ipv6_literal() {
    init();

    let node = HTTPConnect
        .construct("http://[::1]:3128", &resolver())
        .expect("Expected success");

    assert_eq!(node.addr(), &"[::1]:3128".parse().unwrap());
    assert_eq!(node.name(), "http://[::1]:3128");
}

#[test]
fn test_construct_unresolvable() {
    init();

    match HTTPConnect.construct("http://nowhere.example.com:3128", &resolver())
    {
        Err(ProxyError::ResolveError { host, .. }) => {
            assert_eq!(host, "nowhere.example.com")
        }
        res => panic!("Expected resolve error, got {:?}", res)
    }
}

#[test]
fn test_construct_bad_uri() {
    init();

    match HTTPConnect.construct("http://proxy example", &resolver()) {
        Err(ProxyError::BadURI { uri, .. }) => {
            assert_eq!(uri, "http://proxy example")
        }
        res => panic!("Expected bad URI, got {:?}", res)
    }
}

#[test]
fn test_destroy_absent_node() {
    HTTPConnect.destroy(None);

    let node = HTTPConnect
        .construct("http://proxy.example.com", &resolver())
        .expect("Expected success");

    HTTPConnect.destroy(Some(node));
    HTTPConnect.destroy(None);
}

#[test]
fn test_response_ok_short() {
    // 14 bytes, marker included.
    assert!(!response_ok(b"xxxxxxxx200 OK"));
    assert!(!response_ok(b"200 OK"));
    assert!(!response_ok(b""));
}

#[test]
fn test_response_ok_long() {
    assert!(response_ok(b"xxxxxxxxx200 OK"));
    assert!(response_ok(b"HTTP/1.1 200 OK\r\n"));
    assert!(response_ok(b"HTTP/1.0 200 OK"));
}

#[test]
fn test_response_ok_loose_match() {
    // Anything with the marker passes, whatever the status code.
    assert!(response_ok(b"HTTP/1.1 500 Error 200 OK\r\n"));
    assert!(!response_ok(b"HTTP/1.1 200 Connection established\r\n"));
    assert!(!response_ok(b"HTTP/1.1 403 Forbidden\r\n"));
}

#[test]
fn test_connect_request_format() {
    assert_eq!(
        connect_request(&"192.0.2.1:443".parse().unwrap()),
        "CONNECT 192.0.2.1:443 HTTP/1.1\r\n\r\n"
    );
    assert_eq!(
        connect_request(&"[2001:db8::1]:8443".parse().unwrap()),
        "CONNECT 2001:db8::1:8443 HTTP/1.1\r\n\r\n"
    );
}

#[test]
fn test_handle_initial_sends_connect() {
    init();

    let now = Instant::now();
    let mut ctx = single_hop(now);
    let mut reactor = RecordingReactor::default();

    match HTTPConnect.handle(
        &mut ctx,
        &ProxyEvent::connected(),
        &mut reactor,
        now
    ) {
        NegotiationOutcome::Continue => {}
        res => panic!("Expected continue, got {:?}", res)
    }

    assert_eq!(ctx.state(), NegotiationState::HopConnected);
    assert_eq!(
        reactor.requests,
        vec![
            Request::Write {
                timeout: Duration::from_secs(30),
                data: b"CONNECT 203.0.113.5:22 HTTP/1.1\r\n\r\n".to_vec()
            },
            Request::ReadLines {
                timeout: Duration::from_secs(30),
                nlines: 1
            },
        ]
    );
}

#[test]
fn test_handle_ignores_write_completion() {
    init();

    let now = Instant::now();
    let mut ctx = single_hop(now);
    let mut reactor = RecordingReactor::default();

    HTTPConnect.handle(&mut ctx, &ProxyEvent::connected(), &mut reactor, now);
    reactor.requests.clear();

    match HTTPConnect.handle(&mut ctx, &ProxyEvent::written(), &mut reactor, now)
    {
        NegotiationOutcome::Continue => {}
        res => panic!("Expected continue, got {:?}", res)
    }

    assert_eq!(ctx.state(), NegotiationState::HopConnected);
    assert!(reactor.requests.is_empty());
}

#[test]
fn test_handle_short_response_refused() {
    init();

    let now = Instant::now();
    let mut ctx = single_hop(now);
    let mut reactor = RecordingReactor::default();

    HTTPConnect.handle(&mut ctx, &ProxyEvent::connected(), &mut reactor, now);

    match HTTPConnect.handle(
        &mut ctx,
        &ProxyEvent::read(b"xxxxxxxx200 OK".to_vec()),
        &mut reactor,
        now
    ) {
        NegotiationOutcome::Fail(ProxyError::TunnelRefused { node, .. }) => {
            assert_eq!(node, "http://proxy.example.com:8080")
        }
        res => panic!("Expected tunnel refused, got {:?}", res)
    }

    assert_eq!(ctx.state(), NegotiationState::HopConnected);
}

#[test]
fn test_handle_timeout() {
    init();

    let now = Instant::now();
    let mut ctx = single_hop(now);
    let mut reactor = RecordingReactor::default();

    HTTPConnect.handle(&mut ctx, &ProxyEvent::connected(), &mut reactor, now);

    match HTTPConnect.handle(
        &mut ctx,
        &ProxyEvent::timeout(EventType::Read),
        &mut reactor,
        now + Duration::from_secs(30)
    ) {
        NegotiationOutcome::Fail(ProxyError::Timeout { node }) => {
            assert_eq!(node, "http://proxy.example.com:8080")
        }
        res => panic!("Expected timeout, got {:?}", res)
    }
}

#[test]
fn test_handle_established_forwards() {
    init();

    let now = Instant::now();
    let mut ctx = single_hop(now);
    let mut reactor = RecordingReactor::default();

    HTTPConnect.handle(&mut ctx, &ProxyEvent::connected(), &mut reactor, now);

    match HTTPConnect.handle(
        &mut ctx,
        &ProxyEvent::read(b"HTTP/1.1 200 OK\r\n".to_vec()),
        &mut reactor,
        now
    ) {
        NegotiationOutcome::Forward => {}
        res => panic!("Expected forward, got {:?}", res)
    }

    assert_eq!(ctx.state(), NegotiationState::TunnelEstablished);

    let later = ProxyEvent::new(EventType::Timer, EventStatus::Success);

    match HTTPConnect.handle(&mut ctx, &later, &mut reactor, now) {
        NegotiationOutcome::Forward => {}
        res => panic!("Expected forward, got {:?}", res)
    }
}
