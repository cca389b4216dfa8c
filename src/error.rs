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

//! Errors that can occur while building and negotiating proxy chains.
//!
//! All recoverable failures are reported as a [ProxyError].  At the
//! boundary with the application handler these collapse into a
//! single [ProxyError](crate::event::EventStatus::ProxyError) event
//! status; the detail carried here is for diagnostics only.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;
use http::uri::InvalidUri;

/// Errors that can occur in proxy chain setup and negotiation.
#[derive(Debug)]
pub enum ProxyError {
    /// Proxy URI could not be parsed.
    BadURI {
        /// The offending URI.
        uri: String,
        /// The parse error.
        error: InvalidUri
    },
    /// Proxy URI has a port that is zero or out of range.
    BadPort {
        /// The offending URI.
        uri: String
    },
    /// Proxy URI has no host component.
    MissingHost {
        /// The offending URI.
        uri: String
    },
    /// No registered proxy protocol handles the URI's scheme.
    UnknownScheme {
        /// The offending URI.
        uri: String
    },
    /// The proxy host could not be resolved to an address.
    ResolveError {
        /// Host name that failed to resolve.
        host: String,
        /// The underlying resolver error.
        error: Error
    },
    /// A hop refused to open a tunnel.
    TunnelRefused {
        /// Display string of the refusing hop.
        node: String,
        /// Response text received from the hop.
        response: String
    },
    /// A hop did not answer before the connection deadline.
    Timeout {
        /// Display string of the hop that timed out.
        node: String
    }
}

impl ProxyError {
    /// Get the display string of the hop at fault, if the error
    /// occurred during negotiation.
    #[inline]
    pub fn node(&self) -> Option<&str> {
        match self {
            ProxyError::TunnelRefused { node, .. } |
            ProxyError::Timeout { node } => Some(node.as_str()),
            _ => None
        }
    }
}

impl ScopedError for ProxyError {
    fn scope(&self) -> ErrorScope {
        match self {
            // Malformed configuration.
            ProxyError::BadURI { .. } |
            ProxyError::BadPort { .. } |
            ProxyError::MissingHost { .. } |
            ProxyError::UnknownScheme { .. } => ErrorScope::Msg,
            ProxyError::ResolveError { error, .. } => error.scope(),
            // Issues with the proxy servers or network.
            ProxyError::TunnelRefused { .. } | ProxyError::Timeout { .. } => {
                ErrorScope::External
            }
        }
    }
}

impl Display for ProxyError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ProxyError::BadURI { uri, error } => {
                write!(f, "bad proxy URI \"{}\" ({})", uri, error)
            }
            ProxyError::BadPort { uri } => {
                write!(f, "bad port in proxy URI \"{}\"", uri)
            }
            ProxyError::MissingHost { uri } => {
                write!(f, "proxy URI \"{}\" has no host", uri)
            }
            ProxyError::UnknownScheme { uri } => {
                write!(f, "no proxy protocol for URI \"{}\"", uri)
            }
            ProxyError::ResolveError { host, error } => {
                write!(f, "cannot resolve proxy host {} ({})", host, error)
            }
            ProxyError::TunnelRefused { node, response } => {
                if response.is_empty() {
                    write!(f, "connection refused from proxy {}", node)
                } else {
                    write!(
                        f,
                        "connection refused from proxy {} ({})",
                        node, response
                    )
                }
            }
            ProxyError::Timeout { node } => {
                write!(f, "timed out waiting for proxy {}", node)
            }
        }
    }
}

#[cfg(test)]
use std::io::ErrorKind;

#[test]
fn test_negotiation_errors_name_node() {
    let refused = ProxyError::TunnelRefused {
        node: String::from("http://hop2-host:3128"),
        response: String::from("HTTP/1.1 403 Forbidden")
    };
    let timeout = ProxyError::Timeout {
        node: String::from("http://hop1-host:8080")
    };

    assert_eq!(refused.node(), Some("http://hop2-host:3128"));
    assert_eq!(timeout.node(), Some("http://hop1-host:8080"));
    assert!(matches!(refused.scope(), ErrorScope::External));
    assert!(matches!(timeout.scope(), ErrorScope::External));
    assert_eq!(
        refused.to_string(),
        concat!(
            "connection refused from proxy http://hop2-host:3128 ",
            "(HTTP/1.1 403 Forbidden)"
        )
    );
}

#[test]
fn test_setup_errors_have_no_node() {
    let unknown = ProxyError::UnknownScheme {
        uri: String::from("gopher://example.com")
    };
    let bad_port = ProxyError::BadPort {
        uri: String::from("http://proxy.example.com:70000")
    };
    let resolve = ProxyError::ResolveError {
        host: String::from("nowhere.invalid"),
        error: Error::new(ErrorKind::NotFound, "no addresses")
    };

    assert!(unknown.node().is_none());
    assert!(bad_port.node().is_none());
    assert!(resolve.node().is_none());
    assert!(matches!(unknown.scope(), ErrorScope::Msg));
    assert!(matches!(bad_port.scope(), ErrorScope::Msg));
    assert_eq!(
        bad_port.to_string(),
        "bad port in proxy URI \"http://proxy.example.com:70000\""
    );
}
