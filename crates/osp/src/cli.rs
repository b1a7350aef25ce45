//! Command-line interface for osp.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use osp_vpn::{ProxyProtocol, SessionMode};

/// osp - OpenVPN with a split-tunnel local proxy
#[derive(Parser, Debug)]
#[command(
    name = "osp",
    author,
    version,
    about = "Run OpenVPN and expose it through a local SOCKS5/HTTP proxy",
    long_about = r#"
osp supervises the OpenVPN client and, in proxy mode, keeps the system
default route untouched. Only applications pointed at the local proxy
send traffic through the tunnel.

QUICK START:
  Proxy only:  osp start client.ovpn
  Whole host:  osp start client.ovpn --mode system
  With auth:   OVPN_PASSWORD=... osp start client.ovpn -u alice --password-env OVPN_PASSWORD
"#
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Settings file (.toml or .json)
    #[arg(short, long, global = true)]
    pub settings: Option<PathBuf>,

    /// Debug-level diagnostics (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect and serve the proxy until Ctrl-C
    Start(StartArgs),

    /// Show which tunnel binary and helpers would be used
    Locate,
}

#[derive(Args, Debug)]
pub struct StartArgs {
    /// OpenVPN configuration file
    pub config: PathBuf,

    /// Session mode
    #[arg(short, long)]
    pub mode: Option<SessionMode>,

    /// VPN username
    #[arg(short, long)]
    pub username: Option<String>,

    /// Environment variable holding the VPN password
    #[arg(long, value_name = "VAR")]
    pub password_env: Option<String>,

    /// Proxy listen address
    #[arg(short, long, value_name = "HOST:PORT")]
    pub listen: Option<SocketAddr>,

    /// Proxy protocol
    #[arg(short, long)]
    pub protocol: Option<ProxyProtocol>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_start() {
        let cli = Cli::parse_from([
            "osp", "start", "client.ovpn", "--mode", "system", "-u", "alice",
            "--password-env", "PW", "--listen", "127.0.0.1:9050", "--protocol", "auto",
        ]);
        let Commands::Start(args) = cli.command else {
            panic!("expected start");
        };
        assert_eq!(args.config, PathBuf::from("client.ovpn"));
        assert_eq!(args.mode, Some(SessionMode::System));
        assert_eq!(args.username.as_deref(), Some("alice"));
        assert_eq!(args.password_env.as_deref(), Some("PW"));
        assert_eq!(args.listen, Some("127.0.0.1:9050".parse().unwrap()));
        assert_eq!(args.protocol, Some(ProxyProtocol::Auto));
    }

    #[test]
    fn test_parse_locate_with_globals() {
        let cli = Cli::parse_from(["osp", "locate", "--settings", "osp.toml", "-v"]);
        assert!(matches!(cli.command, Commands::Locate));
        assert!(cli.verbose);
        assert_eq!(cli.settings, Some(PathBuf::from("osp.toml")));
    }
}
