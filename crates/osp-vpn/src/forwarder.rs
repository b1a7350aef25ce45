//! Bind-enforcing forwarder pair.
//!
//! Substitute for per-socket source binding: a small local proxy
//! (`gost`) is launched through a bind shim (`ForceBindIP`) that pins all
//! of that one process's outbound sockets to the tunnel address. Only used
//! when both helpers exist in the resource directory.

use crate::config::exe_name;
use crate::log::LogEvent;
use crate::proxy::ProxyProtocol;
use crate::supervisor::{read_output_line, EventSender, LaunchSpec};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Bind shim binary stem
pub const SHIM_STEM: &str = "ForceBindIP64";

/// Local forwarder binary stem
pub const FORWARDER_STEM: &str = "gost";

/// Located helper pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperBinaries {
    pub shim: PathBuf,
    pub forwarder: PathBuf,
}

impl HelperBinaries {
    /// Both helpers, or `None` if either is missing
    pub fn locate(resource_dir: &Path) -> Option<Self> {
        let shim = resource_dir.join(exe_name(SHIM_STEM));
        let forwarder = resource_dir.join(exe_name(FORWARDER_STEM));
        (shim.is_file() && forwarder.is_file()).then_some(Self { shim, forwarder })
    }

    /// `shim <tunnel-addr> <forwarder> -L <scheme>://<listen>`
    pub fn launch_spec(
        &self,
        tunnel_addr: Ipv4Addr,
        listen: SocketAddr,
        protocol: ProxyProtocol,
    ) -> LaunchSpec {
        let scheme = match protocol {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Socks5 | ProxyProtocol::Auto => "socks5",
        };
        LaunchSpec::new(&self.shim)
            .arg(tunnel_addr.to_string())
            .arg(self.forwarder.as_os_str())
            .arg("-L")
            .arg(format!("{}://{}", scheme, listen))
    }
}

/// Running forwarder process; killed on stop or drop
#[derive(Debug)]
pub struct ForwarderProcess {
    child: Child,
    listen: SocketAddr,
}

impl ForwarderProcess {
    pub fn spawn(
        spec: &LaunchSpec,
        listen: SocketAddr,
        events: EventSender,
    ) -> std::io::Result<Self> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn()?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, events.clone()));
        }

        info!(%listen, "Started bind forwarder");
        let _ = events.send(LogEvent::success(format!(
            "Proxy listening on {} (forwarder)",
            listen
        )));
        Ok(Self { child, listen })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    pub fn stop(&mut self) {
        debug!(listen = %self.listen, "Stopping bind forwarder");
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to stop forwarder: {}", e);
        }
    }
}

async fn forward_output<R>(reader: R, events: EventSender)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    while let Ok(Some(line)) = read_output_line(&mut reader, &mut buf).await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event = if line.to_lowercase().contains("error") {
            LogEvent::error(line)
        } else {
            LogEvent::info(line)
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locate_requires_both() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(HelperBinaries::locate(dir.path()), None);

        std::fs::write(dir.path().join(exe_name(SHIM_STEM)), b"").unwrap();
        assert_eq!(HelperBinaries::locate(dir.path()), None);

        std::fs::write(dir.path().join(exe_name(FORWARDER_STEM)), b"").unwrap();
        let helpers = HelperBinaries::locate(dir.path()).unwrap();
        assert!(helpers.forwarder.ends_with(exe_name(FORWARDER_STEM)));
    }

    #[test]
    fn test_launch_spec() {
        let helpers = HelperBinaries {
            shim: PathBuf::from("bin/ForceBindIP64.exe"),
            forwarder: PathBuf::from("bin/gost.exe"),
        };
        let spec = helpers.launch_spec(
            Ipv4Addr::new(10, 8, 0, 6),
            "127.0.0.1:1080".parse().unwrap(),
            ProxyProtocol::Socks5,
        );

        assert_eq!(spec.program, PathBuf::from("bin/ForceBindIP64.exe"));
        let args: Vec<String> = spec
            .args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, vec!["10.8.0.6", "bin/gost.exe", "-L", "socks5://127.0.0.1:1080"]);
    }

    #[tokio::test]
    async fn test_output_survives_invalid_utf8() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let output: &[u8] = b"serve on \xff:1080\n\nlisten tcp: Error bind\n";
        forward_output(output, tx).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.text, "serve on \u{FFFD}:1080");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.level, crate::log::LogLevel::Error);
        assert!(rx.recv().await.is_none());
    }
}
