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

//! Proxy hops and chains of them.
use std::any::Any;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::net::SocketAddr;

#[cfg(feature = "log")]
use log::debug;

use crate::error::ProxyError;
use crate::protocol::ProxyType;
use crate::resolve::Resolve;

/// A single proxy hop.
///
/// Nodes are built by their protocol's
/// [construct](crate::protocol::ProxyProtocol::construct) and never
/// change afterward.
pub struct ProxyNode {
    /// Protocol that owns this node.
    ty: ProxyType,
    /// Resolved address, including the port.
    addr: SocketAddr,
    /// Display string, used for diagnostics.
    name: String,
    /// Protocol-private data.
    private: Option<Box<dyn Any + Send + Sync>>
}

/// Ordered list of proxy hops, first hop first.
///
/// Dropping a chain releases every node through its protocol's
/// [destroy](crate::protocol::ProxyProtocol::destroy).
#[derive(Default)]
pub struct ProxyChain {
    nodes: Vec<ProxyNode>
}

/// Release `nodes` through their owning protocols, first hop first.
pub(crate) fn release_nodes(nodes: &mut Vec<ProxyNode>) {
    for node in nodes.drain(..) {
        node.proxy_type().protocol().destroy(Some(node))
    }
}

impl ProxyNode {
    /// Create a node with no protocol-private data.
    #[inline]
    pub fn new(
        ty: ProxyType,
        addr: SocketAddr,
        name: String
    ) -> ProxyNode {
        ProxyNode {
            ty: ty,
            addr: addr,
            name: name,
            private: None
        }
    }

    /// Create a node carrying protocol-private data.
    #[inline]
    pub fn with_private(
        ty: ProxyType,
        addr: SocketAddr,
        name: String,
        private: Box<dyn Any + Send + Sync>
    ) -> ProxyNode {
        ProxyNode {
            ty: ty,
            addr: addr,
            name: name,
            private: Some(private)
        }
    }

    /// Get the protocol tag.
    #[inline]
    pub fn proxy_type(&self) -> ProxyType {
        self.ty
    }

    /// Get the resolved address of the proxy.
    #[inline]
    pub fn addr(&self) -> &SocketAddr {
        &self.addr
    }

    /// Get the proxy port.
    #[inline]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Get the display string.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the protocol-private data, if it is a `T`.
    #[inline]
    pub fn private<T>(&self) -> Option<&T>
    where
        T: Any {
        self.private
            .as_ref()
            .and_then(|private| private.downcast_ref::<T>())
    }
}

impl ProxyChain {
    /// Create an empty chain, connecting directly to the target.
    #[inline]
    pub fn new() -> ProxyChain {
        ProxyChain { nodes: Vec::new() }
    }

    /// Build a chain from proxy URIs, first hop first.
    ///
    /// If any URI fails, every node built so far is released and the
    /// error is returned.
    pub fn from_uris<I, S>(
        uris: I,
        resolver: &dyn Resolve
    ) -> Result<ProxyChain, ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str> {
        let mut chain = ProxyChain::new();

        chain.extend_from_uris(uris, resolver)?;

        #[cfg(feature = "log")]
        debug!(target: "proxy-chain",
               "built proxy chain [{}]",
               chain);

        Ok(chain)
    }

    /// Append hops built from proxy URIs to the end of the chain.
    ///
    /// Stops at the first URI that fails; hops appended before it
    /// stay in the chain.
    pub fn extend_from_uris<I, S>(
        &mut self,
        uris: I,
        resolver: &dyn Resolve
    ) -> Result<(), ProxyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str> {
        for uri in uris {
            let uri = uri.as_ref();
            let ty = ProxyType::from_uri(uri).ok_or_else(|| {
                ProxyError::UnknownScheme {
                    uri: String::from(uri)
                }
            })?;

            self.push(ty.protocol().construct(uri, resolver)?);
        }

        Ok(())
    }

    /// Build a chain from a comma-separated list of proxy URIs.
    ///
    /// Blank entries are ignored.
    pub fn parse(
        chain: &str,
        resolver: &dyn Resolve
    ) -> Result<ProxyChain, ProxyError> {
        ProxyChain::from_uris(
            chain.split(',').map(str::trim).filter(|uri| !uri.is_empty()),
            resolver
        )
    }

    /// Append a hop to the end of the chain.
    #[inline]
    pub fn push(
        &mut self,
        node: ProxyNode
    ) {
        self.nodes.push(node)
    }

    /// Get the hops, first hop first.
    #[inline]
    pub fn nodes(&self) -> &[ProxyNode] {
        &self.nodes
    }

    /// Get the number of hops.
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check whether the chain has no hops.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub(crate) fn take_nodes(mut self) -> Vec<ProxyNode> {
        std::mem::take(&mut self.nodes)
    }
}

impl Drop for ProxyChain {
    fn drop(&mut self) {
        release_nodes(&mut self.nodes)
    }
}

impl Debug for ProxyNode {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "ProxyNode {{ type: {}, addr: {}, name: {} }}",
            self.ty, self.addr, self.name
        )
    }
}

impl Display for ProxyNode {
    #[inline]
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.name)
    }
}

impl Debug for ProxyChain {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        f.debug_list().entries(self.nodes.iter()).finish()
    }
}

impl Display for ProxyChain {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        let mut first = true;

        for node in &self.nodes {
            if first {
                first = false;
                write!(f, "{}", node)?;
            } else {
                write!(f, " -> {}", node)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
use std::sync::atomic::AtomicUsize;
#[cfg(test)]
use std::sync::atomic::Ordering;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::resolve::StaticResolver;

/// Private payload counting how many nodes have been released.
#[cfg(test)]
struct ReleaseCount(Arc<AtomicUsize>);

#[cfg(test)]
impl Drop for ReleaseCount {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
fn counted_node(
    host: u8,
    released: &Arc<AtomicUsize>
) -> ProxyNode {
    ProxyNode::with_private(
        ProxyType::HTTP,
        SocketAddr::from(([10, 0, 0, host], 8080)),
        format!("http://10.0.0.{}:8080", host),
        Box::new(ReleaseCount(released.clone()))
    )
}

#[cfg(test)]
fn resolver() -> StaticResolver {
    StaticResolver::default()
        .with("hop1-host", "10.0.0.1")
        .with("hop2-host", "10.0.0.2")
}

#[test]
fn test_chain_from_uris() {
    init();

    let chain = ProxyChain::from_uris(
        ["http://hop1-host:3128", "http://hop2-host"],
        &resolver()
    )
    .expect("Expected success");

    assert_eq!(chain.len(), 2);
    assert_eq!(chain.nodes()[0].name(), "http://hop1-host:3128");
    assert_eq!(chain.nodes()[0].addr(), &"10.0.0.1:3128".parse().unwrap());
    assert_eq!(chain.nodes()[1].name(), "http://hop2-host:8080");
    assert_eq!(chain.nodes()[1].port(), 8080);
    assert_eq!(
        chain.to_string(),
        "http://hop1-host:3128 -> http://hop2-host:8080"
    );
}

#[test]
fn test_chain_parse_comma_separated() {
    init();

    let chain =
        ProxyChain::parse(" http://hop1-host:1, ,http://hop2-host:2,", &resolver())
            .expect("Expected success");

    assert_eq!(chain.len(), 2);
    assert_eq!(chain.nodes()[1].port(), 2);
}

#[test]
fn test_chain_parse_empty() {
    let chain = ProxyChain::parse("", &resolver()).expect("Expected success");

    assert!(chain.is_empty());
    assert_eq!(chain.to_string(), "");
}

#[test]
fn test_chain_unknown_scheme() {
    init();

    match ProxyChain::from_uris(
        ["http://hop1-host:3128", "socks4://hop2-host:1080"],
        &resolver()
    ) {
        Err(ProxyError::UnknownScheme { uri }) => {
            assert_eq!(uri, "socks4://hop2-host:1080")
        }
        res => panic!("Expected unknown scheme, got {:?}", res)
    }
}

#[test]
fn test_chain_resolve_failure_partway() {
    init();

    match ProxyChain::from_uris(
        ["http://hop1-host", "http://hop2-host", "http://hop3-host"],
        &resolver()
    ) {
        Err(ProxyError::ResolveError { host, .. }) => {
            assert_eq!(host, "hop3-host")
        }
        res => panic!("Expected resolve error, got {:?}", res)
    }
}

#[test]
fn test_failed_chain_releases_built_hops() {
    init();

    let released = Arc::new(AtomicUsize::new(0));
    let mut chain = ProxyChain::new();

    chain.push(counted_node(1, &released));
    chain.push(counted_node(2, &released));

    match chain.extend_from_uris(["http://hop3-host"], &resolver()) {
        Err(ProxyError::ResolveError { host, .. }) => {
            assert_eq!(host, "hop3-host")
        }
        res => panic!("Expected resolve error, got {:?}", res)
    }

    assert_eq!(chain.len(), 2);
    assert_eq!(released.load(Ordering::SeqCst), 0);

    drop(chain);

    assert_eq!(released.load(Ordering::SeqCst), 2);
}

#[test]
fn test_node_private_data() {
    let node = ProxyNode::with_private(
        ProxyType::HTTP,
        "10.0.0.1:8080".parse().unwrap(),
        String::from("http://10.0.0.1:8080"),
        Box::new(42u32)
    );

    assert_eq!(node.private::<u32>(), Some(&42));
    assert_eq!(node.private::<String>(), None);
    assert_eq!(
        ProxyNode::new(
            ProxyType::HTTP,
            "10.0.0.1:8080".parse().unwrap(),
            String::from("http://10.0.0.1:8080")
        )
        .private::<u32>(),
        None
    );
}
