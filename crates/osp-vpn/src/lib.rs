//! osp VPN - OpenVPN supervisor with a split-tunnel local proxy
//!
//! Runs the OpenVPN client as a child process and, in proxy mode, keeps
//! the host's default route untouched: only traffic sent through the
//! local SOCKS5/HTTP proxy leaves via the tunnel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      osp process                          │
//! │                                                           │
//! │  ┌──────────┐    ┌──────────────┐    outbound sockets    │
//! │  │ Browser/ │───▶│ SOCKS5/HTTP  │───▶ bound to tunnel ───┼──┐
//! │  │  Client  │    │ (127.0.0.1)  │        address         │  │
//! │  └──────────┘    └──────────────┘                        │  │
//! │                                                           │  │
//! │  ┌────────────────────┐  stdout/stderr  ┌─────────────┐  │  │
//! │  │ ProcessSupervisor  │◀────────────────│   openvpn   │◀─┼──┘
//! │  └────────────────────┘                 └─────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Proxy-only mode**: default gateway redirect suppressed or undone
//! - **System mode**: the client's routes apply to the whole host
//! - **Protocol sniffing**: one port serves SOCKS5 and HTTP
//! - **Credential hygiene**: auth file is removed on every exit path

mod config;
mod credentials;
mod error;
mod forwarder;
pub mod log;
pub mod proxy;
mod router;
mod session;
mod supervisor;

pub use config::{
    exe_name, resolve_tunnel_config, ConfigError, OspConfig, ProxySettings, SessionMode,
    SplitSettings, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_PROXY_PORT,
};
pub use credentials::CredentialFile;
pub use error::{Result, VpnError};
pub use forwarder::{ForwarderProcess, HelperBinaries, FORWARDER_STEM, SHIM_STEM};
pub use log::{LogEvent, LogLevel, CONNECTED_MARKER};
pub use proxy::{ProxyBinding, ProxyError, ProxyProtocol, ProxyServer};
pub use router::{
    CommandOutput, CommandRunner, Platform, RouteCommand, RouteError, RouteStrategy,
    SplitTunnelRouter, StrategyOutcome, SystemRunner, PULL_FILTER_ARGS,
};
pub use session::{SessionManager, SessionState, SessionStatus, StartRequest};
pub use supervisor::{
    ConnectFuture, EventSender, LaunchSpec, ProcessHandle, ProcessState, ProcessSupervisor,
};
