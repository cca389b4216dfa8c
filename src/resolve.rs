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

//! Address resolution for proxy nodes.
//!
//! Resolution happens only when a [ProxyNode](crate::node::ProxyNode)
//! is constructed, never during negotiation.
use std::io::Error;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;

#[cfg(feature = "log")]
use log::trace;

/// Resolves host names to socket addresses.
pub trait Resolve {
    /// Resolve `host` to a single socket address with port `port`.
    fn resolve(
        &self,
        host: &str,
        port: u16
    ) -> Result<SocketAddr, Error>;
}

/// [Resolve] instance using the system resolver.
///
/// This blocks while the lookup is in progress.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(
        &self,
        host: &str,
        port: u16
    ) -> Result<SocketAddr, Error> {
        let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
            Error::new(ErrorKind::NotFound, "no addresses for host")
        })?;

        #[cfg(feature = "log")]
        trace!(target: "proxy-chain",
               "resolved {} to {}",
               host, addr);

        Ok(addr)
    }
}

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::net::IpAddr;

/// Fixed host table standing in for DNS.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct StaticResolver {
    hosts: HashMap<String, IpAddr>
}

#[cfg(test)]
impl StaticResolver {
    pub(crate) fn with(
        mut self,
        host: &str,
        addr: &str
    ) -> Self {
        self.hosts.insert(
            String::from(host),
            addr.parse().expect("Expected IP address")
        );

        self
    }
}

#[cfg(test)]
impl Resolve for StaticResolver {
    fn resolve(
        &self,
        host: &str,
        port: u16
    ) -> Result<SocketAddr, Error> {
        match self.hosts.get(host) {
            Some(ip) => Ok(SocketAddr::new(*ip, port)),
            // Only literals fall through to the system.
            None => match host.parse::<IpAddr>() {
                Ok(_) => SystemResolver.resolve(host, port),
                Err(_) => Err(Error::new(ErrorKind::NotFound, "unknown host"))
            }
        }
    }
}

#[test]
fn test_system_resolve_literal() {
    let addr = SystemResolver
        .resolve("127.0.0.1", 3128)
        .expect("Expected success");

    assert_eq!(addr, "127.0.0.1:3128".parse().unwrap());
}

#[test]
fn test_system_resolve_ipv6_literal() {
    let addr = SystemResolver.resolve("::1", 8080).expect("Expected success");

    assert_eq!(addr, "[::1]:8080".parse().unwrap());
}

#[test]
fn test_static_resolve_unknown() {
    let resolver = StaticResolver::default().with("hop1-host", "10.0.0.1");

    assert!(resolver.resolve("hop1-host", 1).is_ok());
    assert!(resolver.resolve("hop9-host", 1).is_err());
}
