//! Split-Tunnel Routing
//!
//! In proxy-only mode the tunnel must not become the default route.
//! Three strategies are attempted in the configured order:
//!
//! | Strategy | When | Effect |
//! |----------|------|--------|
//! | `suppress-at-source` | before spawn | tell the client to ignore pushed `redirect-gateway` |
//! | `remove-after-connect` | after connect | delete the `0.0.0.0/1` + `128.0.0.0/1` halves |
//! | `raise-metric` | after connect | push the tunnel interface metric up |
//!
//! Every strategy is best-effort. Failures are logged and skipped because
//! the explicit per-socket binding in the proxy still works without them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Arguments that filter default-route redirection out of the pushed config
pub const PULL_FILTER_ARGS: [&str; 3] = ["--pull-filter", "ignore", "redirect-gateway"];

/// The two halves a tunnel client installs to override the default route
const DEFAULT_ROUTE_HALVES: [(&str, &str); 2] =
    [("0.0.0.0", "128.0.0.0"), ("128.0.0.0", "128.0.0.0")];

/// stderr fragments meaning "route already gone"
const ROUTE_MISSING_MARKERS: &[&str] = &[
    "No such process",
    "not in table",
    "not found",
    "Element not found",
];

/// Split-tunnel strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteStrategy {
    SuppressAtSource,
    RemoveAfterConnect,
    RaiseMetric,
}

impl RouteStrategy {
    pub fn all() -> &'static [RouteStrategy] {
        &[
            RouteStrategy::SuppressAtSource,
            RouteStrategy::RemoveAfterConnect,
            RouteStrategy::RaiseMetric,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            RouteStrategy::SuppressAtSource => "suppress-at-source",
            RouteStrategy::RemoveAfterConnect => "remove-after-connect",
            RouteStrategy::RaiseMetric => "raise-metric",
        }
    }

    /// Applied before the tunnel process is spawned
    pub fn is_pre_spawn(&self) -> bool {
        matches!(self, RouteStrategy::SuppressAtSource)
    }
}

impl fmt::Display for RouteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Host platform, selects the route tooling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Other
        }
    }
}

/// One external route-tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl RouteCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl fmt::Display for RouteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

/// Captured result of a route-tool run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Executes route tooling; swapped out in tests
pub trait CommandRunner: Send + Sync {
    fn run(&self, cmd: &RouteCommand) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the host
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, cmd: &RouteCommand) -> std::io::Result<CommandOutput> {
        let mut command = Command::new(&cmd.program);
        command.args(&cmd.args);
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let output = command.output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Routing errors (always non-fatal to the session)
#[derive(Debug, Clone, thiserror::Error)]
pub enum RouteError {
    #[error("{strategy} is not supported on {platform:?}")]
    Unsupported {
        strategy: RouteStrategy,
        platform: Platform,
    },

    #[error("No interface carries address {0}")]
    InterfaceNotFound(Ipv4Addr),

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("Failed to run `{command}`: {reason}")]
    Io { command: String, reason: String },
}

/// Result of one attempted strategy
#[derive(Debug, Clone)]
pub struct StrategyOutcome {
    pub strategy: RouteStrategy,
    pub result: Result<(), RouteError>,
}

/// Applies the configured split-tunnel strategies
#[derive(Clone)]
pub struct SplitTunnelRouter {
    strategies: Vec<RouteStrategy>,
    metric: u32,
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
}

impl fmt::Debug for SplitTunnelRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitTunnelRouter")
            .field("strategies", &self.strategies)
            .field("metric", &self.metric)
            .field("platform", &self.platform)
            .finish()
    }
}

impl SplitTunnelRouter {
    pub fn new(strategies: Vec<RouteStrategy>, metric: u32) -> Self {
        Self::with_runner(strategies, metric, Platform::current(), Arc::new(SystemRunner))
    }

    pub fn with_runner(
        strategies: Vec<RouteStrategy>,
        metric: u32,
        platform: Platform,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            strategies,
            metric,
            platform,
            runner,
        }
    }

    /// Extra tunnel-client arguments for the pre-spawn strategy
    pub fn spawn_args(&self) -> Vec<String> {
        if self.strategies.contains(&RouteStrategy::SuppressAtSource) {
            PULL_FILTER_ARGS.iter().map(|a| a.to_string()).collect()
        } else {
            Vec::new()
        }
    }

    /// Run post-connect strategies in order; blocking, never fails
    pub fn after_connect(&self, tunnel_addr: Ipv4Addr) -> Vec<StrategyOutcome> {
        self.strategies
            .iter()
            .filter(|s| !s.is_pre_spawn())
            .map(|&strategy| {
                let result = self.apply(strategy, tunnel_addr);
                match &result {
                    Ok(()) => info!("Split tunnel: {} applied", strategy),
                    Err(e) => warn!("Split tunnel: {} skipped: {}", strategy, e),
                }
                StrategyOutcome { strategy, result }
            })
            .collect()
    }

    fn apply(&self, strategy: RouteStrategy, tunnel_addr: Ipv4Addr) -> Result<(), RouteError> {
        for cmd in self.plan(strategy, tunnel_addr)? {
            self.execute(&cmd)?;
        }
        Ok(())
    }

    /// Commands implementing `strategy` on this platform
    pub fn plan(
        &self,
        strategy: RouteStrategy,
        tunnel_addr: Ipv4Addr,
    ) -> Result<Vec<RouteCommand>, RouteError> {
        let unsupported = RouteError::Unsupported {
            strategy,
            platform: self.platform,
        };

        match (strategy, self.platform) {
            (RouteStrategy::SuppressAtSource, _) => Ok(Vec::new()),

            (RouteStrategy::RemoveAfterConnect, Platform::Linux) => {
                let iface = self.linux_interface(tunnel_addr)?;
                Ok(DEFAULT_ROUTE_HALVES
                    .iter()
                    .map(|(net, _)| {
                        let dest = format!("{}/1", net);
                        RouteCommand::new("ip", &["route", "del", &dest, "dev", &iface])
                    })
                    .collect())
            }
            (RouteStrategy::RemoveAfterConnect, Platform::MacOs) => Ok(DEFAULT_ROUTE_HALVES
                .iter()
                .map(|(net, _)| {
                    let dest = format!("{}/1", net);
                    RouteCommand::new("route", &["-n", "delete", "-net", &dest])
                })
                .collect()),
            (RouteStrategy::RemoveAfterConnect, Platform::Windows) => Ok(DEFAULT_ROUTE_HALVES
                .iter()
                .map(|(net, mask)| RouteCommand::new("route", &["delete", net, "mask", mask]))
                .collect()),

            (RouteStrategy::RaiseMetric, Platform::Windows) => {
                let script = format!(
                    "Get-NetIPAddress -IPAddress {} | Set-NetIPInterface -InterfaceMetric {}",
                    tunnel_addr, self.metric
                );
                Ok(vec![RouteCommand::new(
                    "powershell",
                    &["-NoProfile", "-NonInteractive", "-Command", &script],
                )])
            }

            _ => Err(unsupported),
        }
    }

    fn execute(&self, cmd: &RouteCommand) -> Result<CommandOutput, RouteError> {
        debug!("Running {}", cmd);
        let output = self.runner.run(cmd).map_err(|e| RouteError::Io {
            command: cmd.to_string(),
            reason: e.to_string(),
        })?;

        if output.success || ROUTE_MISSING_MARKERS.iter().any(|m| output.stderr.contains(m)) {
            Ok(output)
        } else {
            Err(RouteError::Command {
                command: cmd.to_string(),
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    fn linux_interface(&self, tunnel_addr: Ipv4Addr) -> Result<String, RouteError> {
        let output = self.execute(&RouteCommand::new("ip", &["-o", "-4", "addr", "show"]))?;
        interface_for_address(&output.stdout, tunnel_addr)
            .ok_or(RouteError::InterfaceNotFound(tunnel_addr))
    }
}

/// Find the interface name in `ip -o -4 addr show` output
///
/// Lines look like `5: tun0    inet 10.8.0.6/24 brd 10.8.0.255 scope global tun0`.
pub fn interface_for_address(ip_addr_output: &str, addr: Ipv4Addr) -> Option<String> {
    let wanted = addr.to_string();
    ip_addr_output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let inet = fields.iter().position(|f| *f == "inet")?;
        let cidr = fields.get(inet + 1)?;
        let ip = cidr.split('/').next()?;
        (ip == wanted).then(|| fields.get(1).map(|name| name.trim_end_matches(':').to_string()))?
    })
}
