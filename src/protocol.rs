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

//! Pluggable proxy protocols.
//!
//! Each supported proxy protocol provides a [ProxyProtocol]
//! instance, which knows how to build [ProxyNode]s from URIs and how
//! to negotiate a tunnel through one hop.  Protocols are looked up
//! by URI scheme prefix through [ProxyType].
use std::fmt::Display;
use std::fmt::Formatter;
use std::time::Instant;

use crate::error::ProxyError;
use crate::event::ProxyEvent;
use crate::event::Reactor;
use crate::http_connect::HTTPConnect;
use crate::node::ProxyNode;
use crate::resolve::Resolve;
use crate::state::ChainContext;

/// Registered proxy protocols, in lookup order.
const PROXY_TYPES: [ProxyType; 1] = [ProxyType::HTTP];

/// Tag identifying a registered proxy protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProxyType {
    /// HTTP `CONNECT` proxy.
    HTTP
}

/// Result of handing one event to a [ProxyProtocol].
#[derive(Debug)]
pub enum NegotiationOutcome {
    /// More bytes are needed; wait for the next event.
    Continue,
    /// The current hop is open and another hop follows it.
    Advance,
    /// The whole chain is open; release the event.
    Forward,
    /// Negotiation failed; release the event with an error status.
    Fail(ProxyError)
}

/// Operations every proxy protocol provides.
pub trait ProxyProtocol: Sync {
    /// Get the tag for this protocol.
    fn proxy_type(&self) -> ProxyType;

    /// Get the URI scheme prefix this protocol handles.
    fn prefix(&self) -> &'static str;

    /// Build a node from `uri`, resolving its host with `resolver`.
    ///
    /// On failure nothing is returned and nothing is left allocated.
    fn construct(
        &self,
        uri: &str,
        resolver: &dyn Resolve
    ) -> Result<ProxyNode, ProxyError>;

    /// Release everything held by `node`.
    ///
    /// Passing `None` does nothing.
    fn destroy(
        &self,
        node: Option<ProxyNode>
    );

    /// Advance negotiation of the current hop of `ctx` with `event`.
    ///
    /// `event` is only borrowed for the duration of the call; any
    /// I/O the protocol needs is requested through `reactor`.
    fn handle(
        &self,
        ctx: &mut ChainContext,
        event: &ProxyEvent,
        reactor: &mut dyn Reactor,
        now: Instant
    ) -> NegotiationOutcome;
}

impl ProxyType {
    /// Find the protocol whose scheme prefix starts `uri`.
    pub fn from_uri(uri: &str) -> Option<ProxyType> {
        PROXY_TYPES.iter().copied().find(|ty| {
            let prefix = ty.prefix();

            uri.len() >= prefix.len() &&
                uri.is_char_boundary(prefix.len()) &&
                uri[..prefix.len()].eq_ignore_ascii_case(prefix)
        })
    }

    /// Get the protocol implementation.
    #[inline]
    pub fn protocol(&self) -> &'static dyn ProxyProtocol {
        match self {
            ProxyType::HTTP => &HTTPConnect
        }
    }

    /// Get the URI scheme prefix.
    #[inline]
    pub fn prefix(&self) -> &'static str {
        self.protocol().prefix()
    }
}

impl Display for ProxyType {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ProxyType::HTTP => write!(f, "HTTP CONNECT")
        }
    }
}

#[test]
fn test_from_uri_http() {
    assert_eq!(
        ProxyType::from_uri("http://proxy.example.com:3128"),
        Some(ProxyType::HTTP)
    );
    assert_eq!(ProxyType::from_uri("HTTP://10.0.0.1"), Some(ProxyType::HTTP));
}

#[test]
fn test_from_uri_unknown() {
    assert_eq!(ProxyType::from_uri("socks4://10.0.0.1:1080"), None);
    assert_eq!(ProxyType::from_uri("http:/"), None);
    assert_eq!(ProxyType::from_uri(""), None);
}

#[test]
fn test_protocol_round_trip() {
    for ty in PROXY_TYPES.iter() {
        assert_eq!(ty.protocol().proxy_type(), *ty);
    }
}
