//! Outbound connections, optionally bound to a source address.

use super::ProxyError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::debug;

/// Timeout for each upstream TCP connect attempt.
pub const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Destination requested by a proxy client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Literal IPs become `Ip`, everything else a domain
    pub fn from_host_port(host: &str, port: u16) -> Self {
        match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            Ok(ip) => TargetAddr::Ip(SocketAddr::new(ip, port)),
            Err(_) => TargetAddr::Domain(host.to_string(), port),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Connect to `target`, binding the local end to `source` when given
///
/// Each resolved address is tried in order with its own timeout.
/// Addresses whose family differs from `source` are skipped since a
/// socket cannot be bound across families.
pub async fn connect_upstream(
    target: &TargetAddr,
    source: Option<IpAddr>,
) -> Result<TcpStream, ProxyError> {
    let resolved: Vec<SocketAddr> = match target {
        TargetAddr::Ip(addr) => vec![*addr],
        TargetAddr::Domain(host, port) => lookup_host((host.as_str(), *port))
            .await
            .map_err(|e| ProxyError::UpstreamConnect {
                host: target.to_string(),
                reason: format!("DNS resolution failed: {}", e),
            })?
            .collect(),
    };

    let mut last_err = None;
    for addr in resolved
        .iter()
        .filter(|a| source.map_or(true, |s| s.is_ipv4() == a.is_ipv4()))
    {
        match tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, connect_one(*addr, source)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", addr, e);
                last_err = Some(e.to_string());
            }
            Err(_) => {
                debug!("Connect to {} timed out", addr);
                last_err = Some("connection timed out".to_string());
            }
        }
    }

    Err(ProxyError::UpstreamConnect {
        host: target.to_string(),
        reason: last_err.unwrap_or_else(|| "no usable addresses".to_string()),
    })
}

async fn connect_one(addr: SocketAddr, source: Option<IpAddr>) -> std::io::Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    if let Some(source) = source {
        socket.bind(SocketAddr::new(source, 0))?;
    }

    let stream = socket.connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
