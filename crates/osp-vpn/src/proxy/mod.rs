//! Local Proxy Server
//!
//! Exposes the tunnel to applications through a loopback listener that
//! speaks a minimal SOCKS5 subset, a minimal HTTP proxy subset, or both
//! (sniffed from the first byte).
//!
//! # Protocol
//!
//! ```text
//! App → proxy (127.0.0.1:1080) → outbound socket ──▶ Internet
//!                                   │
//!                                   └─ bound to the tunnel address in split mode
//! ```
//!
//! Per-connection failures close only that connection; the listener and
//! other connections keep running.

mod http;
mod relay;
mod server;
mod socks;
mod upstream;

pub use http::{parse_request, HttpRequest, BAD_REQUEST_RESPONSE, CONNECT_ESTABLISHED_RESPONSE};
pub use relay::relay;
pub use server::ProxyServer;
pub use socks::{SocksHandshake, SocksState, SocksStep, GREETING_ACK, SUCCESS_REPLY};
pub use upstream::{connect_upstream, TargetAddr, UPSTREAM_CONNECT_TIMEOUT};

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Wire protocol spoken by the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Socks5,
    Http,
    /// SOCKS5 when the first byte is the SOCKS version, HTTP otherwise
    Auto,
}

impl ProxyProtocol {
    /// URL clients should be configured with
    pub fn url(&self, addr: SocketAddr) -> String {
        match self {
            ProxyProtocol::Socks5 | ProxyProtocol::Auto => format!("socks5://{}", addr),
            ProxyProtocol::Http => format!("http://{}", addr),
        }
    }
}

impl std::fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyProtocol::Socks5 => f.write_str("socks5"),
            ProxyProtocol::Http => f.write_str("http"),
            ProxyProtocol::Auto => f.write_str("auto"),
        }
    }
}

impl std::str::FromStr for ProxyProtocol {
    type Err = crate::config::ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "socks5" | "socks" => Ok(ProxyProtocol::Socks5),
            "http" => Ok(ProxyProtocol::Http),
            "auto" => Ok(ProxyProtocol::Auto),
            _ => Err(crate::config::ConfigError::InvalidProtocol(s.to_string())),
        }
    }
}

/// Listener configuration; fixed for the lifetime of a running server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyBinding {
    pub listen_addr: SocketAddr,
    /// Source address for outbound sockets (the tunnel address in split mode)
    pub source_address: Option<IpAddr>,
    pub protocol: ProxyProtocol,
    pub max_connections: usize,
}

impl Default for ProxyBinding {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1080),
            source_address: None,
            protocol: ProxyProtocol::Socks5,
            max_connections: 256,
        }
    }
}

impl ProxyBinding {
    pub fn url(&self) -> String {
        self.protocol.url(self.listen_addr)
    }
}

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Upstream connection failed to {host}: {reason}")]
    UpstreamConnect { host: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
