//! osp: OpenVPN split-tunnel proxy
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! and runs one VPN session until Ctrl-C.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, StartArgs};
use osp_vpn::{exe_name, HelperBinaries, LogEvent, OspConfig, SessionManager, StartRequest};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// How long shutdown waits for trailing events
const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = load_settings(&cli)?;

    match cli.command {
        Commands::Locate => locate(&config),
        Commands::Start(args) => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to build async runtime")?;
            runtime.block_on(start(config, args))
        }
    }
}

fn load_settings(cli: &Cli) -> Result<OspConfig> {
    match &cli.settings {
        Some(path) => OspConfig::from_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display())),
        None => Ok(OspConfig::default()),
    }
}

fn locate(config: &OspConfig) -> Result<()> {
    match config.locate_openvpn() {
        Ok(path) => println!("openvpn: {}", path.display()),
        Err(e) => println!("openvpn: {}", e),
    }

    match HelperBinaries::locate(&config.resource_dir) {
        Some(helpers) => {
            println!("bind shim: {}", helpers.shim.display());
            println!("forwarder: {}", helpers.forwarder.display());
        }
        None => println!(
            "bind helpers: not found in {} ({} / {})",
            config.resource_dir.display(),
            exe_name(osp_vpn::SHIM_STEM),
            exe_name(osp_vpn::FORWARDER_STEM)
        ),
    }
    println!("proxy: {}", config.proxy_url());
    Ok(())
}

async fn start(mut config: OspConfig, args: StartArgs) -> Result<()> {
    if let Some(listen) = args.listen {
        config.proxy.host = listen.ip();
        config.proxy.port = listen.port();
    }
    if let Some(protocol) = args.protocol {
        config.proxy.protocol = protocol;
    }
    config.validate()?;

    let password = match &args.password_env {
        Some(var) => Some(
            std::env::var(var).with_context(|| format!("environment variable {} is not set", var))?,
        ),
        None => None,
    };
    if args.username.is_some() && password.is_none() {
        warn!("Username given without --password-env; credentials are ignored");
    }

    let (vpn, events) = SessionManager::new(config);
    let printer = tokio::spawn(print_events(events));

    let request = StartRequest {
        config_path: args.config,
        username: args.username,
        password,
        mode: args.mode,
    };

    let outcome = tokio::select! {
        result = vpn.start(request) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    match outcome {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            drop(vpn);
            flush_events(printer).await;
            return Err(e.into());
        }
        None => {
            info!("Interrupted while connecting");
            let _ = vpn.stop().await;
            drop(vpn);
            flush_events(printer).await;
            return Ok(());
        }
    }

    let status = vpn.status().await;
    if let Some(addr) = status.assigned_address {
        info!("Tunnel address {}", addr);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutting down");

    if let Err(e) = vpn.stop().await {
        warn!("Stop: {}", e);
    }
    drop(vpn);
    flush_events(printer).await;
    Ok(())
}

/// Wait briefly for the last events; exiting children may still hold senders
async fn flush_events(printer: JoinHandle<()>) {
    let _ = tokio::time::timeout(EVENT_FLUSH_TIMEOUT, printer).await;
}

async fn print_events(mut events: mpsc::UnboundedReceiver<LogEvent>) {
    while let Some(event) = events.recv().await {
        println!("[{}] {}", event.level, event.text);
    }
}
