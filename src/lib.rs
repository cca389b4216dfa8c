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

//! Proxy chain negotiation.
//!
//! This package negotiates connections through chains of proxy
//! servers on behalf of an event-driven socket engine.  Given a list
//! of proxy hops and a final target, it drives each hop through its
//! protocol handshake until a tunnel is open all the way to the
//! target, then hands the connection back to the application as if
//! it had connected directly.  The following functionality is
//! provided:
//!
//! * HTTP `CONNECT` proxies (see [http_connect]).
//!
//! * A [ProxyProtocol](crate::protocol::ProxyProtocol) interface
//!   through which other proxy protocols plug in, selected by URI
//!   scheme prefix.
//!
//! * A generic, non-blocking negotiation state machine that walks the
//!   chain one hop at a time.
//!
//! The reactor that performs the actual I/O is *not* part of this
//! package; it is reached through the [Reactor](crate::event::Reactor)
//! and [ForwardGate](crate::event::ForwardGate) traits.
//!
//! # Usage
//!
//! 1. Build a [ProxyChain](crate::node::ProxyChain) from proxy URIs,
//!    either directly or from
//!    [ProxyChainParams](crate::params::ProxyChainParams), and wrap it
//!    in a [ChainContext](crate::state::ChainContext) together with
//!    the target and a deadline.
//!
//! 1. Create a [ProxyConnection](crate::conn::ProxyConnection) from
//!    the context and the application's handler, and have the reactor
//!    connect the socket to
//!    [connect_addr](crate::conn::ProxyConnection::connect_addr).
//!
//! 1. Feed every event for the connection to
//!    [handle_event](crate::conn::ProxyConnection::handle_event).  The
//!    handler sees a single connect event once the chain is open, or
//!    one with [ProxyError](crate::event::EventStatus::ProxyError)
//!    status if any hop fails.  After that, events pass straight
//!    through.
#![allow(clippy::redundant_field_names)]
#![allow(clippy::upper_case_acronyms)]
pub mod conn;
pub mod error;
pub mod event;
pub mod http_connect;
pub mod node;
pub mod params;
pub mod protocol;
pub mod resolve;
pub mod state;

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
use log::LevelFilter;

#[cfg(test)]
static INIT: Once = Once::new();

#[cfg(test)]
fn init() {
    INIT.call_once(|| {
        env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Trace)
            .init()
    })
}
