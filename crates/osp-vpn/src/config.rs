//! Session Configuration
//!
//! Settings supplied by the surrounding application: where the tunnel
//! binary lives, how the local proxy listens, and which split-tunnel
//! strategies to try. Loadable from TOML or JSON; every field has a default.

use crate::error::VpnError;
use crate::proxy::{ProxyBinding, ProxyProtocol};
use crate::router::RouteStrategy;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default local proxy port
pub const DEFAULT_PROXY_PORT: u16 = 1080;

/// Default bound on waiting for the connection marker
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 120;

/// How the tunnel is exposed to the rest of the system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// Tunnel becomes the default route for all traffic
    #[serde(alias = "system-wide")]
    System,
    /// Only traffic sent through the local proxy uses the tunnel
    #[default]
    #[serde(alias = "proxy-only")]
    Proxy,
}

impl SessionMode {
    pub fn is_proxy_only(&self) -> bool {
        matches!(self, SessionMode::Proxy)
    }
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionMode::System => f.write_str("system"),
            SessionMode::Proxy => f.write_str("proxy"),
        }
    }
}

impl std::str::FromStr for SessionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "system" | "system-wide" => Ok(SessionMode::System),
            "proxy" | "proxy-only" => Ok(SessionMode::Proxy),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

/// Local proxy listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub host: IpAddr,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub max_connections: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PROXY_PORT,
            protocol: ProxyProtocol::Socks5,
            max_connections: 256,
        }
    }
}

impl ProxySettings {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Build the listener binding, optionally source-bound for split mode
    pub fn binding(&self, source_address: Option<IpAddr>) -> ProxyBinding {
        ProxyBinding {
            listen_addr: self.listen_addr(),
            source_address,
            protocol: self.protocol,
            max_connections: self.max_connections,
        }
    }
}

/// Split-tunnel behaviour in proxy-only mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitSettings {
    /// Strategies attempted in order; each failure is logged and skipped
    pub strategies: Vec<RouteStrategy>,
    /// Use the external bind-forwarder pair when both helpers are present
    pub prefer_forwarder: bool,
    /// Interface metric applied by the raise-metric strategy
    pub metric: u32,
}

impl Default for SplitSettings {
    fn default() -> Self {
        Self {
            strategies: RouteStrategy::all().to_vec(),
            prefer_forwarder: false,
            metric: 9999,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OspConfig {
    /// Explicit tunnel binary; searched for when absent
    pub openvpn_path: Option<PathBuf>,
    /// Directory holding bundled binaries and helpers
    pub resource_dir: PathBuf,
    pub mode: SessionMode,
    pub proxy: ProxySettings,
    pub connect_timeout_secs: u64,
    pub split: SplitSettings,
}

impl Default for OspConfig {
    fn default() -> Self {
        Self {
            openvpn_path: None,
            resource_dir: PathBuf::from("bin"),
            mode: SessionMode::default(),
            proxy: ProxySettings::default(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            split: SplitSettings::default(),
        }
    }
}

impl OspConfig {
    /// Load from a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content),
            Some("json") => Self::from_json(&content),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.proxy.max_connections == 0 {
            return Err(ConfigError::InvalidMaxConnections);
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Proxy URL for client configuration
    pub fn proxy_url(&self) -> String {
        self.proxy.protocol.url(self.proxy.listen_addr())
    }

    /// Candidate tunnel binary locations, most specific first
    pub fn openvpn_search_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(explicit) = &self.openvpn_path {
            paths.push(explicit.clone());
        }
        paths.push(self.resource_dir.join(exe_name("openvpn")));
        paths.extend(platform_install_paths());
        paths
    }

    /// First existing tunnel binary, or `BinaryNotFound`
    pub fn locate_openvpn(&self) -> Result<PathBuf, VpnError> {
        let searched = self.openvpn_search_paths();
        match searched.iter().find(|p| p.is_file()) {
            Some(found) => Ok(found.clone()),
            None => Err(VpnError::BinaryNotFound { searched }),
        }
    }
}

/// Resolve a tunnel config path against the current directory
pub fn resolve_tunnel_config(path: &Path) -> Result<PathBuf, VpnError> {
    let resolved = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };

    if resolved.is_file() {
        Ok(resolved)
    } else {
        Err(VpnError::ConfigNotFound(resolved))
    }
}

/// Append the platform executable suffix
pub fn exe_name(stem: &str) -> String {
    if cfg!(windows) {
        format!("{stem}.exe")
    } else {
        stem.to_string()
    }
}

#[cfg(windows)]
fn platform_install_paths() -> Vec<PathBuf> {
    let program_files =
        std::env::var_os("ProgramFiles").unwrap_or_else(|| "C:\\Program Files".into());
    let program_files_x86 = std::env::var_os("ProgramFiles(x86)")
        .unwrap_or_else(|| "C:\\Program Files (x86)".into());

    [program_files, program_files_x86]
        .into_iter()
        .map(|root| PathBuf::from(root).join("OpenVPN").join("bin").join("openvpn.exe"))
        .collect()
}

#[cfg(not(windows))]
fn platform_install_paths() -> Vec<PathBuf> {
    ["/usr/sbin", "/usr/local/sbin", "/opt/homebrew/sbin", "/usr/bin"]
        .iter()
        .map(|dir| Path::new(dir).join("openvpn"))
        .collect()
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid proxy port")]
    InvalidPort,

    #[error("Connect timeout must be at least one second")]
    InvalidTimeout,

    #[error("max_connections must be non-zero")]
    InvalidMaxConnections,

    #[error("Unknown mode: {0} (expected \"proxy\" or \"system\")")]
    InvalidMode(String),

    #[error("Unknown proxy protocol: {0}")]
    InvalidProtocol(String),

    #[error("Unsupported config format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("Failed to read config: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = OspConfig::default();

        assert_eq!(config.proxy.port, 1080);
        assert_eq!(config.mode, SessionMode::Proxy);
        assert_eq!(config.connect_timeout(), Duration::from_secs(120));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_proxy_url() {
        let config = OspConfig::default();
        assert_eq!(config.proxy_url(), "socks5://127.0.0.1:1080");
    }

    #[test]
    fn test_partial_toml() {
        let config = OspConfig::from_toml(
            r#"
            mode = "system"
            connect_timeout_secs = 30

            [proxy]
            port = 8080
            protocol = "http"

            [split]
            strategies = ["raise-metric"]
            "#,
        )
        .unwrap();

        assert_eq!(config.mode, SessionMode::System);
        assert_eq!(config.proxy.port, 8080);
        assert_eq!(config.proxy.protocol, ProxyProtocol::Http);
        assert_eq!(config.proxy.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(config.split.strategies, vec![RouteStrategy::RaiseMetric]);
        assert_eq!(config.split.metric, 9999);
    }

    #[test]
    fn test_json_round_trip_of_defaults() {
        let config = OspConfig::from_json("{}").unwrap();
        assert_eq!(config, OspConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let err = OspConfig::from_toml("[proxy]\nport = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPort));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("proxy-only".parse::<SessionMode>().unwrap(), SessionMode::Proxy);
        assert_eq!("SYSTEM".parse::<SessionMode>().unwrap(), SessionMode::System);
        assert!("split".parse::<SessionMode>().is_err());
    }

    #[test]
    fn test_search_paths_order() {
        let config = OspConfig {
            openvpn_path: Some(PathBuf::from("/custom/openvpn")),
            resource_dir: PathBuf::from("res"),
            ..OspConfig::default()
        };
        let paths = config.openvpn_search_paths();

        assert_eq!(paths[0], PathBuf::from("/custom/openvpn"));
        assert_eq!(paths[1], PathBuf::from("res").join(exe_name("openvpn")));
        assert!(paths.len() > 2);
    }

    #[test]
    fn test_locate_in_resource_dir() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join(exe_name("openvpn"));
        std::fs::write(&exe, b"").unwrap();

        let config = OspConfig {
            resource_dir: dir.path().to_path_buf(),
            ..OspConfig::default()
        };
        assert_eq!(config.locate_openvpn().unwrap(), exe);
    }

    #[test]
    fn test_locate_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = OspConfig {
            openvpn_path: Some(dir.path().join("nope")),
            resource_dir: dir.path().join("missing"),
            ..OspConfig::default()
        };
        // Only meaningful where no system-wide install exists
        if config.openvpn_search_paths().iter().skip(2).all(|p| !p.is_file()) {
            assert!(matches!(
                config.locate_openvpn(),
                Err(VpnError::BinaryNotFound { .. })
            ));
        }
    }

    #[test]
    fn test_resolve_tunnel_config() {
        let dir = tempfile::tempdir().unwrap();
        let ovpn = dir.path().join("client.ovpn");
        std::fs::write(&ovpn, b"client\n").unwrap();

        assert_eq!(resolve_tunnel_config(&ovpn).unwrap(), ovpn);
        assert!(matches!(
            resolve_tunnel_config(&dir.path().join("other.ovpn")),
            Err(VpnError::ConfigNotFound(_))
        ));
    }
}
