//! HTTP proxy subset: CONNECT tunnels and absolute-form forwarding.
//!
//! Exactly one header block is parsed per connection. After the request
//! is forwarded the connection is a plain relay; pipelined requests pass
//! through as opaque bytes.

use super::relay::relay;
use super::upstream::{connect_upstream, TargetAddr};
use super::ProxyError;
use std::net::IpAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::{Host, Url};

/// Reply to a successful CONNECT
pub const CONNECT_ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Reply to an unparseable request
pub const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Largest header block accepted before giving up
const MAX_HEADER_BYTES: usize = 64 * 1024;

const DEFAULT_HTTP_PORT: u16 = 80;

/// A fully parsed proxy request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpRequest {
    /// `CONNECT host:port`; `trailing` is anything buffered after the headers
    Tunnel { target: TargetAddr, trailing: Vec<u8> },
    /// Any other method; `payload` is the rewritten header block plus
    /// already-buffered body bytes, ready to send upstream
    Forward { target: TargetAddr, payload: Vec<u8> },
}

/// Parse a buffered request
///
/// Returns `Ok(None)` until the blank line ending the header block arrives.
pub fn parse_request(buf: &[u8]) -> Result<Option<HttpRequest>, ProxyError> {
    let Some(end) = find(buf, HEADER_TERMINATOR) else {
        if buf.len() > MAX_HEADER_BYTES {
            return Err(ProxyError::BadRequest("header block too large".into()));
        }
        return Ok(None);
    };

    let head = &buf[..end];
    let body = &buf[end + HEADER_TERMINATOR.len()..];

    let line_end = find(head, b"\r\n").unwrap_or(head.len());
    let request_line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| ProxyError::BadRequest("request line is not UTF-8".into()))?;
    let header_lines = head.get(line_end + 2..).unwrap_or_default();

    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let target = parts.next().unwrap_or_default();

    if method == "CONNECT" {
        let target = parse_authority(target)
            .ok_or_else(|| ProxyError::BadRequest(format!("CONNECT target {:?}", target)))?;
        return Ok(Some(HttpRequest::Tunnel {
            target,
            trailing: body.to_vec(),
        }));
    }

    let (upstream, request_line) = if target.starts_with("http://") {
        let url = Url::parse(target)
            .map_err(|e| ProxyError::BadRequest(format!("URL {:?}: {}", target, e)))?;
        let upstream = url_target(&url)
            .ok_or_else(|| ProxyError::BadRequest(format!("URL {:?} has no host", target)))?;
        let origin_form = match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        };
        (upstream, request_line.replacen(target, &origin_form, 1))
    } else {
        let upstream = host_header_target(header_lines)
            .ok_or_else(|| ProxyError::BadRequest("no absolute URL or Host header".into()))?;
        (upstream, request_line.to_string())
    };

    let mut payload = Vec::with_capacity(buf.len());
    payload.extend_from_slice(request_line.as_bytes());
    payload.extend_from_slice(b"\r\n");
    if !header_lines.is_empty() {
        payload.extend_from_slice(header_lines);
        payload.extend_from_slice(b"\r\n");
    }
    payload.extend_from_slice(b"\r\n");
    payload.extend_from_slice(body);

    Ok(Some(HttpRequest::Forward {
        target: upstream,
        payload,
    }))
}

/// `host:port` with a non-empty host free of colons and whitespace
fn parse_authority(authority: &str) -> Option<TargetAddr> {
    let (host, port) = authority.split_once(':')?;
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return None;
    }
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(TargetAddr::from_host_port(host, port.parse().ok()?))
}

fn url_target(url: &Url) -> Option<TargetAddr> {
    let port = url.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT);
    let target = match url.host()? {
        Host::Domain(domain) => TargetAddr::Domain(domain.to_string(), port),
        Host::Ipv4(ip) => TargetAddr::Ip((IpAddr::V4(ip), port).into()),
        Host::Ipv6(ip) => TargetAddr::Ip((IpAddr::V6(ip), port).into()),
    };
    Some(target)
}

fn host_header_target(header_lines: &[u8]) -> Option<TargetAddr> {
    let text = String::from_utf8_lossy(header_lines);
    let value = text.split("\r\n").find_map(|line| {
        let (name, rest) = line.split_at_checked(5)?;
        if !name.eq_ignore_ascii_case("host:") || !rest.starts_with(char::is_whitespace) {
            return None;
        }
        Some(rest.trim().to_string())
    })?;

    let mut pieces = value.split(':');
    let host = pieces.next().filter(|h| !h.is_empty())?;
    let port = match pieces.next() {
        Some(p) => p.parse().ok()?,
        None => DEFAULT_HTTP_PORT,
    };
    Some(TargetAddr::from_host_port(host, port))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one request from `stream`, connect upstream, then relay
pub(crate) async fn serve(
    mut stream: TcpStream,
    source_address: Option<IpAddr>,
    buffer_size: usize,
) -> Result<(), ProxyError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = vec![0u8; buffer_size];

    let request = loop {
        match parse_request(&buf) {
            Ok(Some(request)) => break request,
            Ok(None) => {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    debug!("HTTP client closed before completing headers");
                    return Ok(());
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => {
                stream.write_all(BAD_REQUEST_RESPONSE).await?;
                let _ = stream.shutdown().await;
                return Err(e);
            }
        }
    };

    match request {
        HttpRequest::Tunnel { target, trailing } => {
            debug!("HTTP CONNECT to {}", target);
            let upstream = connect_upstream(&target, source_address).await?;
            stream.write_all(CONNECT_ESTABLISHED_RESPONSE).await?;
            relay(stream, upstream, trailing).await?;
        }
        HttpRequest::Forward { target, payload } => {
            debug!("HTTP forward to {}", target);
            let upstream = connect_upstream(&target, source_address).await?;
            relay(stream, upstream, payload).await?;
        }
    }

    Ok(())
}
