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

//! Parameters for setting up proxy chains.
use std::convert::TryFrom;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::Instant;

use serde::Deserialize;

use crate::error::ProxyError;
use crate::node::ProxyChain;
use crate::resolve::Resolve;
use crate::state::ChainContext;

/// Default negotiation timeout, in milliseconds.
const DEFAULT_TIMEOUT_MS: u64 = 10000;

/// Longest deadline used when the configured timeout overflows the
/// clock (about a century).
const MAX_DEADLINE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Proxy chain parameters.
///
/// These can be deserialized from configuration, for example:
///
/// ```yaml
/// proxies:
///   - http://proxy1.example.com:3128
///   - http://proxy2.example.com
/// timeout: 5000
/// ```
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
pub struct ProxyChainParams {
    /// Proxy URIs, first hop first.
    #[serde(default)]
    proxies: Vec<String>,
    /// Negotiation timeout for the whole chain, in milliseconds.
    #[serde(default = "ProxyChainParams::default_timeout")]
    timeout: u64
}

impl ProxyChainParams {
    #[inline]
    fn default_timeout() -> u64 {
        DEFAULT_TIMEOUT_MS
    }

    /// Create parameters from a list of proxy URIs.
    #[inline]
    pub fn new(
        proxies: Vec<String>,
        timeout: Duration
    ) -> ProxyChainParams {
        ProxyChainParams {
            proxies: proxies,
            timeout: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
        }
    }

    /// Create parameters from a comma-separated list of proxy URIs.
    ///
    /// Blank entries are ignored.
    pub fn from_chain_str(
        chain: &str,
        timeout: Duration
    ) -> ProxyChainParams {
        let proxies = chain
            .split(',')
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
            .map(String::from)
            .collect();

        ProxyChainParams::new(proxies, timeout)
    }

    /// Get the proxy URIs, first hop first.
    #[inline]
    pub fn proxies(&self) -> &[String] {
        &self.proxies
    }

    /// Get the negotiation timeout for the whole chain.
    #[inline]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    /// Build the proxy chain, resolving every hop with `resolver`.
    #[inline]
    pub fn build(
        &self,
        resolver: &dyn Resolve
    ) -> Result<ProxyChain, ProxyError> {
        ProxyChain::from_uris(&self.proxies, resolver)
    }

    /// Build a [ChainContext] for a connection to `target` started
    /// at `now`.
    pub fn context(
        &self,
        resolver: &dyn Resolve,
        target: SocketAddr,
        now: Instant
    ) -> Result<ChainContext, ProxyError> {
        let chain = self.build(resolver)?;
        let deadline = now
            .checked_add(self.timeout())
            .unwrap_or_else(|| now + MAX_DEADLINE);

        Ok(ChainContext::new(chain, target, deadline))
    }
}

impl Default for ProxyChainParams {
    #[inline]
    fn default() -> ProxyChainParams {
        ProxyChainParams {
            proxies: Vec::new(),
            timeout: DEFAULT_TIMEOUT_MS
        }
    }
}

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::resolve::StaticResolver;

#[test]
fn test_deserialize_full() {
    let json = r#"{
        "proxies": ["http://hop1-host:3128", "http://hop2-host"],
        "timeout": 2500
    }"#;
    let params: ProxyChainParams =
        serde_json::from_str(json).expect("Expected success");

    assert_eq!(
        params.proxies(),
        &[
            String::from("http://hop1-host:3128"),
            String::from("http://hop2-host")
        ]
    );
    assert_eq!(params.timeout(), Duration::from_millis(2500));
}

#[test]
fn test_deserialize_defaults() {
    let params: ProxyChainParams =
        serde_json::from_str("{}").expect("Expected success");

    assert_eq!(params, ProxyChainParams::default());
    assert!(params.proxies().is_empty());
    assert_eq!(params.timeout(), Duration::from_secs(10));
}

#[test]
fn test_from_chain_str() {
    let params = ProxyChainParams::from_chain_str(
        "http://hop1-host:3128, http://hop2-host,,",
        Duration::from_secs(3)
    );

    assert_eq!(
        params.proxies(),
        &[
            String::from("http://hop1-host:3128"),
            String::from("http://hop2-host")
        ]
    );
    assert_eq!(params.timeout(), Duration::from_secs(3));
}

#[test]
fn test_new_saturates_timeout() {
    let params = ProxyChainParams::new(Vec::new(), Duration::MAX);

    assert_eq!(params.timeout(), Duration::from_millis(u64::MAX));
}

#[test]
fn test_context_deadline() {
    init();

    let resolver = StaticResolver::default()
        .with("hop1-host", "10.0.0.1")
        .with("hop2-host", "10.0.0.2");
    let params = ProxyChainParams::from_chain_str(
        "http://hop1-host:3128,http://hop2-host",
        Duration::from_secs(3)
    );
    let now = Instant::now();
    let ctx = params
        .context(&resolver, "192.0.2.7:443".parse().unwrap(), now)
        .expect("Expected success");

    assert_eq!(ctx.nodes().len(), 2);
    assert_eq!(ctx.deadline(), now + Duration::from_secs(3));
    assert_eq!(ctx.connect_addr(), "10.0.0.1:3128".parse().unwrap());
}

#[test]
fn test_context_resolve_failure() {
    init();

    let params = ProxyChainParams::from_chain_str(
        "http://hop1-host:3128",
        Duration::from_secs(3)
    );

    match params.context(
        &StaticResolver::default(),
        "192.0.2.7:443".parse().unwrap(),
        Instant::now()
    ) {
        Err(ProxyError::ResolveError { host, .. }) => {
            assert_eq!(host, "hop1-host")
        }
        Err(err) => panic!("Expected resolve error, got {}", err),
        Ok(_) => panic!("Expected resolve error")
    }
}
