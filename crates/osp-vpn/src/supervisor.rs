//! Tunnel Process Supervisor
//!
//! Launches the external tunnel client and turns its unstructured output
//! into a deterministic connect outcome.
//!
//! # Lifecycle
//!
//! ```text
//! spawn ──▶ scan stdout/stderr ──▶ marker seen ──▶ Ok(())
//!                  │
//!                  ├── no marker within timeout ──▶ Err(ConnectTimeout)
//!                  └── process exits first ──────▶ Err(ProcessExited(code))
//! ```
//!
//! The outcome resolves at most once. Output keeps being scanned after
//! resolution so the assigned address stays current and log lines still
//! reach the event sink until the process exits.

use crate::error::{Result, VpnError};
use crate::log::{self, LogEvent, CONNECTED_MARKER};
use std::ffi::OsString;
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tracing::{debug, info, warn};

/// Sender half of the user-visible event channel
pub type EventSender = mpsc::UnboundedSender<LogEvent>;

/// How long to wait for buffered output after the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Observed process state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    /// Exited; `None` when killed by a signal
    Exited(Option<i32>),
}

impl ProcessState {
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }
}

/// What to launch
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }
}

/// Spawns tunnel processes and supervises their output
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    connect_timeout: Duration,
    events: EventSender,
}

impl ProcessSupervisor {
    pub fn new(connect_timeout: Duration, events: EventSender) -> Self {
        Self {
            connect_timeout,
            events,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Spawn the process and begin scanning its output
    ///
    /// Returns immediately. The caller owns the returned handle and must
    /// call [`ProcessHandle::stop`] if the connect future fails and the
    /// process should not be left running.
    pub fn start(&self, spec: &LaunchSpec) -> Result<(ProcessHandle, ConnectFuture)> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = cmd.spawn().map_err(VpnError::Spawn)?;
        let pid = child.id();
        info!(program = %spec.program.display(), pid = ?pid, "Spawned tunnel process");

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, line_tx));
        }

        let (address_tx, address_rx) = watch::channel(None);
        let (state_tx, state_rx) = watch::channel(ProcessState::Running);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let stop = Arc::new(Notify::new());

        let driver = Driver {
            child,
            pid,
            lines: line_rx,
            address: address_tx,
            state: state_tx,
            outcome: Some(outcome_tx),
            stop: stop.clone(),
            events: self.events.clone(),
            connect_timeout: self.connect_timeout,
        };
        tokio::spawn(driver.run());

        let handle = ProcessHandle {
            address: address_rx,
            state: state_rx,
            stop,
        };
        Ok((handle, ConnectFuture { rx: outcome_rx }))
    }
}

/// Shared view of a supervised process
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    address: watch::Receiver<Option<Ipv4Addr>>,
    state: watch::Receiver<ProcessState>,
    stop: Arc<Notify>,
}

impl ProcessHandle {
    /// Last address announced in the output, if any
    pub fn current_assigned_address(&self) -> Option<Ipv4Addr> {
        *self.address.borrow()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Clear "already running" signal for callers enforcing one session
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Request graceful termination without waiting for exit
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    /// Wait until the process has exited; returns the exit code if any
    pub async fn wait_exit(&self) -> Option<i32> {
        let mut state = self.state.clone();
        match state.wait_for(|s| !s.is_running()).await {
            Ok(s) => match *s {
                ProcessState::Exited(code) => code,
                ProcessState::Running => None,
            },
            // driver gone without publishing; treat as exited
            Err(_) => None,
        }
    }
}

/// Resolves once: connected, timed out, or exited early
#[derive(Debug)]
pub struct ConnectFuture {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for ConnectFuture {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(VpnError::ProcessTerminated)))
    }
}

/// Read one output line, decoding invalid UTF-8 lossily
///
/// Returns `Ok(None)` at end of stream. Trailing `\r\n` is stripped.
pub(crate) async fn read_output_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf);
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    loop {
        match read_output_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Tunnel output read error: {}", e);
                break;
            }
        }
    }
}

enum Action {
    Line(Option<String>),
    Timeout,
    Stop,
    Exited(std::io::Result<ExitStatus>),
}

struct Driver {
    child: Child,
    pid: Option<u32>,
    lines: mpsc::UnboundedReceiver<String>,
    address: watch::Sender<Option<Ipv4Addr>>,
    state: watch::Sender<ProcessState>,
    outcome: Option<oneshot::Sender<Result<()>>>,
    stop: Arc<Notify>,
    events: EventSender,
    connect_timeout: Duration,
}

impl Driver {
    async fn run(mut self) {
        let timer = tokio::time::sleep(self.connect_timeout);
        tokio::pin!(timer);
        let mut lines_open = true;

        loop {
            let action = tokio::select! {
                biased;
                line = self.lines.recv(), if lines_open => Action::Line(line),
                _ = &mut timer, if self.outcome.is_some() => Action::Timeout,
                _ = self.stop.notified() => Action::Stop,
                status = self.child.wait() => Action::Exited(status),
            };

            match action {
                Action::Line(Some(line)) => self.handle_line(&line),
                Action::Line(None) => lines_open = false,
                Action::Timeout => {
                    warn!(
                        "No connection marker within {}s",
                        self.connect_timeout.as_secs()
                    );
                    self.resolve(Err(VpnError::ConnectTimeout {
                        marker: CONNECTED_MARKER,
                        secs: self.connect_timeout.as_secs(),
                    }));
                }
                Action::Stop => self.terminate(),
                Action::Exited(status) => {
                    let code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            warn!("Failed to wait for tunnel process: {}", e);
                            None
                        }
                    };
                    self.finish(code, lines_open).await;
                    return;
                }
            }
        }
    }

    fn handle_line(&mut self, line: &str) {
        let report = log::classify(line);

        if let Some(addr) = report.address {
            debug!(%addr, "Tunnel address announced");
            self.address.send_replace(Some(addr));
        }
        if report.connected && self.outcome.is_some() {
            info!("Tunnel connection completed");
            self.resolve(Ok(()));
        }
        if let Some(level) = report.display {
            let _ = self.events.send(LogEvent::new(level, line));
        }
    }

    fn resolve(&mut self, outcome: Result<()>) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        match self.pid {
            Some(pid) => {
                debug!(pid, "Sending SIGTERM to tunnel process");
                // SAFETY: plain kill(2) on a pid we spawned and have not reaped
                let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
                if rc != 0 {
                    warn!(pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
                }
            }
            None => debug!("Tunnel process already reaped"),
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to terminate tunnel process: {}", e);
        }
    }

    async fn finish(&mut self, code: Option<i32>, lines_open: bool) {
        if lines_open {
            let drain = async {
                while let Some(line) = self.lines.recv().await {
                    self.handle_line(&line);
                }
            };
            if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
                debug!("Tunnel output still open after exit");
            }
        }

        info!(code = ?code, "Tunnel process exited");
        if self.outcome.is_some() {
            let err = match code {
                Some(c) if c != 0 => VpnError::ProcessExited(c),
                _ => VpnError::ProcessTerminated,
            };
            self.resolve(Err(err));
        }
        self.state.send_replace(ProcessState::Exited(code));
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::log::LogLevel;

    fn supervisor(timeout: Duration) -> (ProcessSupervisor, mpsc::UnboundedReceiver<LogEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ProcessSupervisor::new(timeout, tx), rx)
    }

    fn script(body: &str) -> LaunchSpec {
        LaunchSpec::new("/bin/sh").arg("-c").arg(body)
    }

    #[test]
    fn test_launch_spec_builder() {
        let spec = LaunchSpec::new("openvpn")
            .args(["--config", "client.ovpn"])
            .working_dir("/etc/openvpn");

        assert_eq!(spec.args.len(), 2);
        assert_eq!(spec.working_dir, Some(PathBuf::from("/etc/openvpn")));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let (sup, _rx) = supervisor(Duration::from_secs(5));
        let result = sup.start(&LaunchSpec::new("/nonexistent/openvpn-binary"));
        assert!(matches!(result, Err(VpnError::Spawn(_))));
    }

    #[tokio::test]
    async fn test_stderr_is_scanned() {
        let (sup, _rx) = supervisor(Duration::from_secs(5));
        let (handle, connected) = sup
            .start(&script(
                "echo 'Initialization Sequence Completed' 1>&2; exec sleep 5",
            ))
            .unwrap();

        connected.await.unwrap();
        handle.stop();
        handle.wait_exit().await;
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn test_nonzero_exit_before_marker() {
        let (sup, _rx) = supervisor(Duration::from_secs(5));
        let (handle, connected) = sup.start(&script("echo 'Options error'; exit 3")).unwrap();

        assert!(matches!(connected.await, Err(VpnError::ProcessExited(3))));
        assert_eq!(handle.wait_exit().await, Some(3));
    }

    #[tokio::test]
    async fn test_clean_exit_before_marker() {
        let (sup, _rx) = supervisor(Duration::from_secs(5));
        let (_handle, connected) = sup.start(&script("exit 0")).unwrap();
        assert!(matches!(connected.await, Err(VpnError::ProcessTerminated)));
    }

    #[tokio::test]
    async fn test_timeout_without_marker() {
        let (sup, _rx) = supervisor(Duration::from_millis(300));
        let (handle, connected) = sup
            .start(&script("echo 'TLS: Initial packet'; exec sleep 5"))
            .unwrap();

        assert!(matches!(
            connected.await,
            Err(VpnError::ConnectTimeout { marker: CONNECTED_MARKER, .. })
        ));
        // the caller decides; the process is still up until stopped
        assert!(handle.is_running());
        handle.stop();
        handle.wait_exit().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_is_two_minutes() {
        let timeout = crate::config::OspConfig::default().connect_timeout();
        let (sup, _rx) = supervisor(timeout);
        let started = tokio::time::Instant::now();
        let (handle, connected) = sup.start(&script("exec sleep 300")).unwrap();

        let err = connected.await.unwrap_err();
        assert!(matches!(err, VpnError::ConnectTimeout { secs: 120, .. }));
        assert!(started.elapsed() >= Duration::from_secs(120));

        handle.stop();
        handle.wait_exit().await;
    }

    #[tokio::test]
    async fn test_address_and_events() {
        let (sup, mut rx) = supervisor(Duration::from_secs(5));
        let (handle, connected) = sup
            .start(&script(
                "echo 'PUSH: Received control message: PUSH_REPLY,ifconfig 10.8.0.6 255.0.0.0'; \
                 echo 'noise line'; \
                 echo 'Initialization Sequence Completed'; exec sleep 5",
            ))
            .unwrap();

        connected.await.unwrap();
        assert_eq!(handle.current_assigned_address(), Some(Ipv4Addr::new(10, 8, 0, 6)));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.level, LogLevel::Info);
        assert!(first.text.contains("PUSH_REPLY"));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.level, LogLevel::Success);

        handle.stop();
        assert_eq!(handle.wait_exit().await, None);
    }

    #[tokio::test]
    async fn test_last_address_wins() {
        let (sup, _rx) = supervisor(Duration::from_secs(5));
        let (handle, connected) = sup
            .start(&script(
                "echo 'PUSH_REPLY,ifconfig 10.8.0.6 255.255.255.0'; \
                 echo 'PUSH_REPLY,ifconfig 10.8.0.10 255.255.255.0'; \
                 echo 'Initialization Sequence Completed'; exec sleep 5",
            ))
            .unwrap();

        connected.await.unwrap();
        assert_eq!(handle.current_assigned_address(), Some(Ipv4Addr::new(10, 8, 0, 10)));

        handle.stop();
        handle.wait_exit().await;
    }

    #[tokio::test]
    async fn test_non_utf8_line_keeps_scanning() {
        let (sup, mut rx) = supervisor(Duration::from_secs(5));
        let (handle, connected) = sup
            .start(&script(
                "printf 'VERIFY OK: CN=M\\374ller\\n'; sleep 0.2; \
                 echo 'Initialization Sequence Completed'; exec sleep 5",
            ))
            .unwrap();

        connected.await.unwrap();
        assert!(handle.is_running());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.text, "VERIFY OK: CN=M\u{FFFD}ller");

        handle.stop();
        assert_eq!(handle.wait_exit().await, None);
    }

    #[tokio::test]
    async fn test_read_output_line_is_lossy() {
        let mut reader: &[u8] = b"bad \xfc byte\r\nnext\n\nlast";
        let mut buf = Vec::new();

        let mut lines = Vec::new();
        while let Some(line) = read_output_line(&mut reader, &mut buf).await.unwrap() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["bad \u{FFFD} byte", "next", "", "last"]);
    }

    #[tokio::test]
    async fn test_late_exit_after_connect() {
        let (sup, _rx) = supervisor(Duration::from_secs(5));
        let (handle, connected) = sup
            .start(&script("echo 'Initialization Sequence Completed'; sleep 0.2; exit 2"))
            .unwrap();

        connected.await.unwrap();
        assert_eq!(handle.wait_exit().await, Some(2));
        assert_eq!(handle.state(), ProcessState::Exited(Some(2)));
    }
}
