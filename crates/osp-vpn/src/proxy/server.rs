//! Listener and per-connection task management.

use super::{http, socks, ProxyBinding, ProxyError, ProxyProtocol};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Read buffer per connection
const BUFFER_SIZE: usize = 16 * 1024;

/// SOCKS5 version byte, used to sniff the protocol in auto mode
const SOCKS5_VERSION: u8 = 0x05;

/// Running proxy listener
///
/// Stopping (or dropping) the server stops accepting, aborts every
/// in-flight relay pair and releases the listening socket.
pub struct ProxyServer {
    binding: ProxyBinding,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    active_connections: Arc<AtomicU64>,
}

impl ProxyServer {
    /// Bind the listener and start accepting in a background task
    pub async fn start(binding: ProxyBinding) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(binding.listen_addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: binding.listen_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(
            "{} proxy listening on {} (max {} connections{})",
            binding.protocol,
            local_addr,
            binding.max_connections,
            binding
                .source_address
                .map(|a| format!(", outbound via {}", a))
                .unwrap_or_default()
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicU64::new(0));
        let acceptor = Acceptor {
            listener,
            protocol: binding.protocol,
            source_address: binding.source_address,
            semaphore: Arc::new(Semaphore::new(binding.max_connections)),
            active: active_connections.clone(),
        };
        let task = tokio::spawn(acceptor.run(shutdown_rx));

        Ok(Self {
            binding,
            local_addr,
            shutdown,
            task: Some(task),
            active_connections,
        })
    }

    /// Actual bound address (differs from the binding when port 0 was asked)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Proxy URL for client configuration
    pub fn url(&self) -> String {
        self.binding.protocol.url(self.local_addr)
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Stop accepting, close all relay pairs, and release the port
    pub async fn stop(mut self) {
        info!("Stopping proxy on {}", self.local_addr);
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Proxy accept task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Acceptor {
    listener: TcpListener,
    protocol: ProxyProtocol,
    source_address: Option<IpAddr>,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicU64>,
}

impl Acceptor {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Accept error: {}", e);
                            continue;
                        }
                    };

                    let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                        warn!("Connection limit reached, dropping {}", peer);
                        continue;
                    };

                    let protocol = self.protocol;
                    let source = self.source_address;
                    let active = self.active.clone();
                    active.fetch_add(1, Ordering::Relaxed);

                    connections.spawn(async move {
                        debug!("Proxy connection from {}", peer);
                        if let Err(e) = handle_client(stream, protocol, source).await {
                            debug!("Connection from {} closed: {}", peer, e);
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                        drop(permit);
                    });
                }
            }
        }

        drop(self.listener);
        let in_flight = connections.len();
        connections.shutdown().await;
        // aborted tasks never reach their own decrement
        self.active.store(0, Ordering::Relaxed);
        debug!("Proxy stopped, closed {} in-flight connections", in_flight);
    }
}

async fn handle_client(
    stream: TcpStream,
    protocol: ProxyProtocol,
    source: Option<IpAddr>,
) -> Result<(), ProxyError> {
    let protocol = match protocol {
        ProxyProtocol::Auto => sniff(&stream).await?,
        fixed => fixed,
    };

    match protocol {
        ProxyProtocol::Http => http::serve(stream, source, BUFFER_SIZE).await,
        _ => socks::serve(stream, source, BUFFER_SIZE).await,
    }
}

async fn sniff(stream: &TcpStream) -> Result<ProxyProtocol, ProxyError> {
    let mut first = [0u8; 1];
    let n = stream.peek(&mut first).await?;
    if n == 1 && first[0] == SOCKS5_VERSION {
        Ok(ProxyProtocol::Socks5)
    } else {
        Ok(ProxyProtocol::Http)
    }
}
