//! Session-level error types.

use crate::proxy::ProxyError;
use std::path::PathBuf;

/// Errors surfaced by session start/stop and the process supervisor
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("Tunnel binary not found (searched: {})", display_paths(.searched))]
    BinaryNotFound { searched: Vec<PathBuf> },

    #[error("Config file not found: {}", .0.display())]
    ConfigNotFound(PathBuf),

    #[error("VPN connection timeout (no \"{marker}\" within {secs}s)")]
    ConnectTimeout { marker: &'static str, secs: u64 },

    #[error("Tunnel process exited with code {0}")]
    ProcessExited(i32),

    #[error("Tunnel process terminated before the connection completed")]
    ProcessTerminated,

    #[error("VPN is already running")]
    AlreadyRunning,

    #[error("VPN is not running")]
    NotRunning,

    #[error("Failed to spawn tunnel process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Credential file error: {0}")]
    Credentials(#[source] std::io::Error),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl VpnError {
    /// Failures reported through the connect outcome rather than before spawn
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            VpnError::ConnectTimeout { .. }
                | VpnError::ProcessExited(_)
                | VpnError::ProcessTerminated
        )
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result alias for session operations
pub type Result<T> = std::result::Result<T, VpnError>;
