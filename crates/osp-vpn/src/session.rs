//! Session Orchestration
//!
//! Sequences one VPN session: spawn the tunnel client, wait for the
//! connection marker, apply split routing, then expose the proxy. Teardown
//! runs in the reverse order.
//!
//! # Usage
//!
//! ```rust,ignore
//! let (vpn, mut events) = SessionManager::new(OspConfig::default());
//! tokio::spawn(async move {
//!     while let Some(ev) = events.recv().await {
//!         println!("[{}] {}", ev.level, ev.text);
//!     }
//! });
//!
//! vpn.start(StartRequest::new("client.ovpn")).await?;
//! println!("{:?}", vpn.status().await.proxy_url);
//! vpn.stop().await?;
//! ```
//!
//! Only one session may be starting or connected at a time; a second
//! `start` fails with `AlreadyRunning` and leaves the first untouched.

use crate::config::{resolve_tunnel_config, OspConfig, SessionMode};
use crate::credentials::CredentialFile;
use crate::error::{Result, VpnError};
use crate::forwarder::{ForwarderProcess, HelperBinaries};
use crate::log::LogEvent;
use crate::proxy::ProxyServer;
use crate::router::SplitTunnelRouter;
use crate::supervisor::{EventSender, LaunchSpec, ProcessHandle, ProcessSupervisor};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Connected,
    Stopping,
    Failed,
}

impl SessionState {
    /// A session in this state blocks new starts
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Connected | SessionState::Stopping
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

/// Parameters for one start
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub config_path: PathBuf,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Overrides the configured mode
    pub mode: Option<SessionMode>,
}

impl StartRequest {
    pub fn new(config_path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: config_path.into(),
            ..Self::default()
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn mode(mut self, mode: SessionMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub mode: Option<SessionMode>,
    pub assigned_address: Option<Ipv4Addr>,
    pub proxy_url: Option<String>,
    pub uptime: Option<Duration>,
}

enum ProxyBackend {
    InProcess(ProxyServer),
    Forwarder(ForwarderProcess),
}

impl ProxyBackend {
    fn url(&self, protocol: crate::proxy::ProxyProtocol) -> String {
        match self {
            ProxyBackend::InProcess(server) => server.url(),
            ProxyBackend::Forwarder(fwd) => protocol.url(fwd.listen_addr()),
        }
    }
}

/// The single active session
struct Session {
    id: u64,
    mode: SessionMode,
    process: ProcessHandle,
    credentials: Option<CredentialFile>,
    proxy: Option<ProxyBackend>,
    started_at: Instant,
    connected_at: Option<Instant>,
}

struct Inner {
    state: SessionState,
    session: Option<Session>,
    next_id: u64,
}

impl Inner {
    /// The current session is the one started as `id`
    fn owns(&self, id: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.id == id)
    }
}

/// Owns the session and serializes start/stop against it
pub struct SessionManager {
    config: OspConfig,
    router: SplitTunnelRouter,
    supervisor: ProcessSupervisor,
    inner: Arc<Mutex<Inner>>,
    events: EventSender,
}

impl SessionManager {
    /// Create a manager and the receiving end of its event channel
    pub fn new(config: OspConfig) -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let router = SplitTunnelRouter::new(config.split.strategies.clone(), config.split.metric);
        Self::with_router(config, router)
    }

    /// Same as [`SessionManager::new`] with a caller-supplied router
    pub fn with_router(
        config: OspConfig,
        router: SplitTunnelRouter,
    ) -> (Self, mpsc::UnboundedReceiver<LogEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::new(config.connect_timeout(), events.clone());

        let manager = Self {
            config,
            router,
            supervisor,
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Idle,
                session: None,
                next_id: 1,
            })),
            events,
        };
        (manager, rx)
    }

    pub fn config(&self) -> &OspConfig {
        &self.config
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await.is_connected()
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        let session = inner.session.as_ref();
        SessionStatus {
            state: inner.state,
            mode: session.map(|s| s.mode),
            assigned_address: session.and_then(|s| s.process.current_assigned_address()),
            proxy_url: session
                .and_then(|s| s.proxy.as_ref())
                .map(|p| p.url(self.config.proxy.protocol)),
            uptime: session.and_then(|s| s.connected_at).map(|t| t.elapsed()),
        }
    }

    /// Start a session and wait until it is connected and proxied
    ///
    /// Precondition failures return before anything is spawned. Connect
    /// failures tear down whatever was started before being returned.
    pub async fn start(&self, request: StartRequest) -> Result<()> {
        let mode = request.mode.unwrap_or(self.config.mode);

        let (id, connected) = {
            let mut inner = self.inner.lock().await;
            if inner.state.is_active() {
                return Err(VpnError::AlreadyRunning);
            }

            let openvpn = self.config.locate_openvpn()?;
            let config_path = resolve_tunnel_config(&request.config_path)?;

            // leftovers from a session that was never torn down
            if let Some(stale) = inner.session.take() {
                warn!("Cleaning up stale session {}", stale.id);
                teardown(stale).await;
            }

            let credentials = if CredentialFile::wanted(
                request.username.as_deref(),
                request.password.as_deref(),
            ) {
                Some(
                    CredentialFile::create(
                        request.username.as_deref().unwrap_or_default(),
                        request.password.as_deref().unwrap_or_default(),
                    )
                    .map_err(VpnError::Credentials)?,
                )
            } else {
                None
            };

            let mut spec = LaunchSpec::new(&openvpn).arg("--config").arg(config_path.as_os_str());
            if mode.is_proxy_only() {
                spec = spec.args(self.router.spawn_args());
            }
            if let Some(creds) = &credentials {
                spec = spec.arg("--auth-user-pass").arg(creds.path().as_os_str());
            }
            if let Some(dir) = config_path.parent() {
                spec = spec.working_dir(dir);
            }

            self.emit(LogEvent::info("Starting OpenVPN..."));
            // `credentials` drops (and deletes) on spawn failure
            let (process, connected) = self.supervisor.start(&spec)?;

            let id = inner.next_id;
            inner.next_id += 1;
            inner.session = Some(Session {
                id,
                mode,
                process,
                credentials,
                proxy: None,
                started_at: Instant::now(),
                connected_at: None,
            });
            inner.state = SessionState::Starting;
            info!(id, %mode, "Session starting");
            (id, connected)
        };

        match connected.await {
            Ok(()) => self.on_connected(id).await,
            Err(e) => {
                self.fail(id, &e).await;
                Err(e)
            }
        }
    }

    async fn on_connected(&self, id: u64) -> Result<()> {
        let (process, mode) = {
            let inner = self.inner.lock().await;
            match inner.session.as_ref() {
                Some(s) if s.id == id && inner.state == SessionState::Starting => {
                    (s.process.clone(), s.mode)
                }
                // stopped while connecting
                _ => return Err(VpnError::NotRunning),
            }
        };
        self.emit(LogEvent::success("VPN connected."));

        let tunnel_addr = process.current_assigned_address();
        let source = match (mode, tunnel_addr) {
            (SessionMode::Proxy, Some(addr)) => {
                self.apply_split_routing(addr).await;
                Some(IpAddr::V4(addr))
            }
            (SessionMode::Proxy, None) => {
                self.emit(LogEvent::info(
                    "No tunnel address announced; proxy uses the default route",
                ));
                None
            }
            (SessionMode::System, _) => None,
        };

        let backend = match self.start_proxy(mode, tunnel_addr, source).await {
            Ok(backend) => backend,
            Err(e) => {
                self.fail(id, &e).await;
                return Err(e);
            }
        };

        let url = backend.url(self.config.proxy.protocol);
        let rejected = {
            let mut guard = self.inner.lock().await;
            let inner = &mut *guard;
            let still_starting = inner.state == SessionState::Starting;
            match inner.session.as_mut() {
                Some(s) if s.id == id && still_starting => {
                    s.proxy = Some(backend);
                    s.connected_at = Some(Instant::now());
                    inner.state = SessionState::Connected;
                    None
                }
                _ => Some(backend),
            }
        };
        if let Some(backend) = rejected {
            stop_backend(backend).await;
            return Err(VpnError::NotRunning);
        }

        let scope = match mode {
            SessionMode::Proxy => "proxy only",
            SessionMode::System => "system",
        };
        self.emit(LogEvent::success(format!("Proxy: {} ({})", url, scope)));
        info!(id, %url, "Session connected");

        tokio::spawn(watch_exit(id, process, self.inner.clone(), self.events.clone()));
        Ok(())
    }

    async fn apply_split_routing(&self, addr: Ipv4Addr) {
        let router = self.router.clone();
        match tokio::task::spawn_blocking(move || router.after_connect(addr)).await {
            Ok(outcomes) => {
                for outcome in outcomes {
                    if let Err(e) = outcome.result {
                        debug!("{} not applied: {}", outcome.strategy, e);
                    }
                }
            }
            Err(e) => warn!("Split routing task failed: {}", e),
        }
    }

    async fn start_proxy(
        &self,
        mode: SessionMode,
        tunnel_addr: Option<Ipv4Addr>,
        source: Option<IpAddr>,
    ) -> Result<ProxyBackend> {
        let settings = &self.config.proxy;

        if mode.is_proxy_only() && self.config.split.prefer_forwarder {
            let helpers = HelperBinaries::locate(&self.config.resource_dir);
            if let (Some(helpers), Some(addr)) = (helpers, tunnel_addr) {
                let listen = settings.listen_addr();
                let spec = helpers.launch_spec(addr, listen, settings.protocol);
                match ForwarderProcess::spawn(&spec, listen, self.events.clone()) {
                    Ok(fwd) => return Ok(ProxyBackend::Forwarder(fwd)),
                    Err(e) => warn!("Bind forwarder failed, using direct binding: {}", e),
                }
            } else {
                debug!("Bind forwarder unavailable, using direct binding");
            }
        }

        let server = ProxyServer::start(settings.binding(source)).await?;
        Ok(ProxyBackend::InProcess(server))
    }

    async fn fail(&self, id: u64, err: &VpnError) {
        let session = {
            let mut inner = self.inner.lock().await;
            if inner.owns(id) {
                inner.state = SessionState::Failed;
                inner.session.take()
            } else {
                None
            }
        };

        error!("Session failed: {}", err);
        self.emit(LogEvent::error(err.to_string()));
        if matches!(err, VpnError::ProcessExited(1)) {
            self.emit(LogEvent::info(
                "Tip: exit code 1 usually means adapter or route setup failed; \
                 try again with administrator privileges.",
            ));
        }

        if let Some(session) = session {
            teardown(session).await;
        }
    }

    /// Stop the session: proxy, relays, process, credential file
    pub async fn stop(&self) -> Result<()> {
        let session = {
            let mut inner = self.inner.lock().await;
            let Some(session) = inner.session.take() else {
                return Err(VpnError::NotRunning);
            };
            inner.state = SessionState::Stopping;
            session
        };

        info!(id = session.id, "Stopping session");
        teardown(session).await;

        self.inner.lock().await.state = SessionState::Idle;
        self.emit(LogEvent::info("VPN and proxy stopped."));
        Ok(())
    }

    fn emit(&self, event: LogEvent) {
        let _ = self.events.send(event);
    }
}

/// Best-effort teardown; every step runs even if an earlier one fails
async fn teardown(mut session: Session) {
    if let Some(backend) = session.proxy.take() {
        stop_backend(backend).await;
    }

    session.process.stop();

    if let Some(mut creds) = session.credentials.take() {
        if let Err(e) = creds.remove() {
            warn!("Failed to remove credential file: {}", e);
        }
    }

    debug!(
        id = session.id,
        lifetime = ?session.started_at.elapsed(),
        "Session torn down"
    );
}

async fn stop_backend(backend: ProxyBackend) {
    match backend {
        ProxyBackend::InProcess(server) => server.stop().await,
        ProxyBackend::Forwarder(mut fwd) => fwd.stop(),
    }
}

/// Clear the session when its process exits on its own
async fn watch_exit(
    id: u64,
    process: ProcessHandle,
    inner: Arc<Mutex<Inner>>,
    events: EventSender,
) {
    let code = process.wait_exit().await;

    let session = {
        let mut inner = inner.lock().await;
        if inner.owns(id) {
            inner.state = SessionState::Stopping;
            inner.session.take()
        } else {
            None
        }
    };

    if let Some(session) = session {
        warn!(id, code = ?code, "Tunnel process exited; session closed");
        let text = match code {
            Some(c) => format!("OpenVPN exited with code {}", c),
            None => "OpenVPN terminated".to_string(),
        };
        let _ = events.send(LogEvent::error(text));
        teardown(session).await;

        let mut inner = inner.lock().await;
        if inner.state == SessionState::Stopping && inner.session.is_none() {
            inner.state = SessionState::Idle;
        }
    }
}
