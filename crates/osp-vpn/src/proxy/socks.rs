//! SOCKS5 subset: no-auth greeting, CONNECT only.
//!
//! The handshake is a pure state machine over a growable receive buffer
//! so partial reads can be replayed byte by byte in tests. The async
//! driver in [`serve`] only moves bytes between the socket and the machine.

use super::relay::relay;
use super::upstream::{connect_upstream, TargetAddr};
use super::ProxyError;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;

/// Smallest possible request (domain type with a zero-length name)
const MIN_REQUEST_LEN: usize = 7;

/// Method selection reply: no authentication required
pub const GREETING_ACK: [u8; 2] = [SOCKS5_VERSION, AUTH_NO_AUTH];

/// CONNECT success reply with zeroed bind address and port
pub const SUCCESS_REPLY: [u8; 10] = [
    SOCKS5_VERSION,
    REPLY_SUCCESS,
    0x00, // Reserved
    ADDR_IPV4,
    0, 0, 0, 0, // Bind address (0.0.0.0)
    0, 0,       // Bind port (0)
];

/// Handshake state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksState {
    Greeting,
    Request,
    Relay,
}

/// What the driver should do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksStep {
    /// Not enough buffered bytes; read more
    NeedMore,
    /// Write these bytes to the client, then advance again
    Reply(&'static [u8]),
    /// Open the outbound connection; remaining buffer belongs to the relay
    Connect(TargetAddr),
    /// Close the client without replying
    Close(String),
}

/// Per-connection SOCKS5 handshake
#[derive(Debug)]
pub struct SocksHandshake {
    state: SocksState,
}

impl Default for SocksHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl SocksHandshake {
    pub fn new() -> Self {
        Self {
            state: SocksState::Greeting,
        }
    }

    pub fn state(&self) -> SocksState {
        self.state
    }

    /// Consume whatever complete message `buf` holds
    ///
    /// Consumed bytes are drained from the front of `buf`; incomplete
    /// messages leave both the buffer and the state untouched.
    pub fn advance(&mut self, buf: &mut Vec<u8>) -> SocksStep {
        match self.state {
            SocksState::Greeting => self.greeting(buf),
            SocksState::Request => self.request(buf),
            SocksState::Relay => SocksStep::NeedMore,
        }
    }

    fn greeting(&mut self, buf: &mut Vec<u8>) -> SocksStep {
        if buf.len() < 2 {
            return SocksStep::NeedMore;
        }
        if buf[0] != SOCKS5_VERSION {
            return SocksStep::Close(format!("greeting version {:#04x}", buf[0]));
        }

        let total = 2 + buf[1] as usize;
        if buf.len() < total {
            return SocksStep::NeedMore;
        }

        buf.drain(..total);
        self.state = SocksState::Request;
        SocksStep::Reply(&GREETING_ACK)
    }

    fn request(&mut self, buf: &mut Vec<u8>) -> SocksStep {
        if buf.len() < MIN_REQUEST_LEN {
            return SocksStep::NeedMore;
        }
        if buf[0] != SOCKS5_VERSION {
            return SocksStep::Close(format!("request version {:#04x}", buf[0]));
        }
        if buf[1] != CMD_CONNECT {
            return SocksStep::Close(format!("unsupported command {:#04x}", buf[1]));
        }

        let (target, consumed) = match buf[3] {
            ADDR_IPV4 => {
                let total = 4 + 4 + 2;
                if buf.len() < total {
                    return SocksStep::NeedMore;
                }
                let ip = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
                let port = read_port(buf, total);
                (TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port)), total)
            }
            ADDR_DOMAIN => {
                let len = buf[4] as usize;
                let total = 4 + 1 + len + 2;
                if buf.len() < total {
                    return SocksStep::NeedMore;
                }
                let host = String::from_utf8_lossy(&buf[5..5 + len]).into_owned();
                let port = read_port(buf, total);
                (TargetAddr::Domain(host, port), total)
            }
            ADDR_IPV6 => {
                let total = 4 + 16 + 2;
                if buf.len() < total {
                    return SocksStep::NeedMore;
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[4..20]);
                let port = read_port(buf, total);
                (
                    TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)),
                    total,
                )
            }
            other => return SocksStep::Close(format!("unknown address type {:#04x}", other)),
        };

        buf.drain(..consumed);
        self.state = SocksState::Relay;
        SocksStep::Connect(target)
    }
}

fn read_port(buf: &[u8], total: usize) -> u16 {
    u16::from_be_bytes([buf[total - 2], buf[total - 1]])
}

/// Run the SOCKS5 handshake on `stream`, then relay until either side closes
pub(crate) async fn serve(
    mut stream: TcpStream,
    source_address: Option<IpAddr>,
    buffer_size: usize,
) -> Result<(), ProxyError> {
    let mut buf = Vec::with_capacity(64);
    let mut chunk = vec![0u8; buffer_size];
    let mut handshake = SocksHandshake::new();

    loop {
        match handshake.advance(&mut buf) {
            SocksStep::NeedMore => {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    debug!("SOCKS5 client closed during handshake");
                    return Ok(());
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            SocksStep::Reply(bytes) => stream.write_all(bytes).await?,
            SocksStep::Close(reason) => return Err(ProxyError::ProtocolViolation(reason)),
            SocksStep::Connect(target) => {
                debug!("SOCKS5 CONNECT to {}", target);
                // dropping `stream` on failure closes the client with no reply
                let upstream = connect_upstream(&target, source_address).await?;
                stream.write_all(&SUCCESS_REPLY).await?;

                relay(stream, upstream, buf).await?;
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn greeted() -> SocksHandshake {
        let mut hs = SocksHandshake::new();
        let mut buf = vec![0x05, 0x01, 0x00];
        assert_eq!(hs.advance(&mut buf), SocksStep::Reply(&GREETING_ACK));
        hs
    }

    #[test]
    fn test_short_greeting_waits() {
        let mut hs = SocksHandshake::new();
        let mut buf = vec![];
        assert_eq!(hs.advance(&mut buf), SocksStep::NeedMore);

        buf.push(0x05);
        assert_eq!(hs.advance(&mut buf), SocksStep::NeedMore);
        assert_eq!(buf, vec![0x05]);
        assert_eq!(hs.state(), SocksState::Greeting);
    }

    #[test]
    fn test_greeting_waits_for_methods() {
        let mut hs = SocksHandshake::new();
        let mut buf = vec![0x05, 0x02, 0x00];
        assert_eq!(hs.advance(&mut buf), SocksStep::NeedMore);

        buf.push(0x02);
        assert_eq!(hs.advance(&mut buf), SocksStep::Reply(&[0x05, 0x00]));
        assert!(buf.is_empty());
        assert_eq!(hs.state(), SocksState::Request);
    }

    #[test]
    fn test_bad_greeting_version() {
        let mut hs = SocksHandshake::new();
        let mut buf = vec![0x04, 0x01, 0x00];
        assert!(matches!(hs.advance(&mut buf), SocksStep::Close(_)));
    }

    #[test]
    fn test_unsupported_command_closes() {
        let mut hs = greeted();
        // BIND
        let mut buf = vec![0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80];
        assert!(matches!(hs.advance(&mut buf), SocksStep::Close(_)));
    }

    #[test]
    fn test_ipv4_request_single_pass() {
        let mut hs = greeted();
        let mut buf = vec![0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB, b'x'];

        let step = hs.advance(&mut buf);
        assert_eq!(
            step,
            SocksStep::Connect(TargetAddr::Ip("93.184.216.34:443".parse().unwrap()))
        );
        assert_eq!(buf, vec![b'x']);
        assert_eq!(hs.state(), SocksState::Relay);
    }

    #[test]
    fn test_ipv4_request_partial() {
        let mut hs = greeted();
        let mut buf = vec![0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1];
        assert_eq!(hs.advance(&mut buf), SocksStep::NeedMore);
        assert_eq!(buf.len(), 8);
        assert_eq!(hs.state(), SocksState::Request);
    }

    #[test]
    fn test_domain_request() {
        let mut hs = greeted();
        let mut buf = vec![0x05, 0x01, 0x00, 0x03, 11];
        buf.extend_from_slice(b"example.com");
        assert_eq!(hs.advance(&mut buf), SocksStep::NeedMore);

        buf.extend_from_slice(&[0x00, 0x50]);
        assert_eq!(
            hs.advance(&mut buf),
            SocksStep::Connect(TargetAddr::Domain("example.com".into(), 80))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ipv6_request_needs_22_bytes() {
        let mut hs = greeted();
        let mut buf = vec![0x05, 0x01, 0x00, 0x04];
        buf.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        buf.push(0x1F);
        assert_eq!(buf.len(), 21);
        assert_eq!(hs.advance(&mut buf), SocksStep::NeedMore);

        buf.push(0x90);
        assert_eq!(
            hs.advance(&mut buf),
            SocksStep::Connect(TargetAddr::Ip("[::1]:8080".parse().unwrap()))
        );
    }

    #[test]
    fn test_unknown_address_type() {
        let mut hs = greeted();
        let mut buf = vec![0x05, 0x01, 0x00, 0x07, 0, 0, 0, 0, 0, 0];
        assert!(matches!(hs.advance(&mut buf), SocksStep::Close(_)));
    }

    #[test]
    fn test_greeting_and_request_in_one_buffer() {
        let mut hs = SocksHandshake::new();
        let mut buf = vec![0x05, 0x01, 0x00, 0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 22];

        assert_eq!(hs.advance(&mut buf), SocksStep::Reply(&GREETING_ACK));
        assert_eq!(
            hs.advance(&mut buf),
            SocksStep::Connect(TargetAddr::Ip("1.2.3.4:22".parse().unwrap()))
        );
    }

    #[test]
    fn test_success_reply_frame() {
        assert_eq!(SUCCESS_REPLY.len(), 10);
        assert_eq!(&SUCCESS_REPLY[..4], &[0x05, 0x00, 0x00, 0x01]);
        assert!(SUCCESS_REPLY[4..].iter().all(|b| *b == 0));
    }
}
