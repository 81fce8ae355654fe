//! berthd - container lifecycle daemon.
//!
//! Composes the `berth` library: loads the configuration, wires the remote
//! execution backend and the directory-backed collaborators, restores
//! persisted containers, ingests backend events and stops containers on
//! SIGINT/SIGTERM.
//!
//! # Usage
//!
//! ```text
//! berthd daemon [--config <path>]    Run the daemon
//! berthd config [--config <path>]    Print the effective configuration
//! berthd version                     Show version info
//! berthd help                        Show this help
//! ```

use anyhow::{Context, bail};
use berth::daemon::Collaborators;
use berth::local::{LocalImageStore, LocalLayerStore, LocalVolumeStore, LoopbackNetwork, NoLabels};
use berth::{Daemon, DaemonConfig, LinuxPlatform, Platform, RemoteBackend};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

// =============================================================================
// Command Table
// =============================================================================

/// Parsed command-line options shared by all commands.
#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
}

type Handler = fn(&Options) -> anyhow::Result<()>;

/// Command name to handler.
const COMMANDS: &[(&str, Handler)] = &[
    ("daemon", cmd_daemon),
    ("config", cmd_config),
    ("version", cmd_version),
    ("help", cmd_help),
];

fn parse_args() -> anyhow::Result<(Handler, Options)> {
    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "daemon".to_string());
    let Some(&(_, handler)) = COMMANDS.iter().find(|(name, _)| *name == command) else {
        bail!("unknown command: {}", command);
    };

    let mut options = Options::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config requires a path")?;
                options.config = Some(PathBuf::from(path));
            }
            other => bail!("unexpected argument: {}", other),
        }
    }
    Ok((handler, options))
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_daemon(options: &Options) -> anyhow::Result<()> {
    let config = DaemonConfig::load(options.config.as_deref()).context("failed to load config")?;

    let level = if config.debug { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_ansi(false)
        .compact()
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        bail!("failed to set tracing subscriber");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    runtime.block_on(run_daemon(config))
}

async fn run_daemon(config: DaemonConfig) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        root = %config.root.display(),
        "berthd starting"
    );

    let platform = Platform::detect();
    info!(
        platform = %platform.oci_platform(),
        kernel = platform.kernel_version.as_deref().unwrap_or("unknown"),
        "detected host"
    );
    if !platform.supports_containers() {
        warn!(platform = %platform, "host lacks container support, starts will likely fail");
    }

    let backend = RemoteBackend::new(&config.backend_socket);
    if let Err(e) = backend.ping().await {
        warn!(socket = %config.backend_socket.display(), error = %e, "backend not reachable yet");
    }

    let collaborators = Collaborators {
        images: Arc::new(LocalImageStore::new(&config.root)),
        layers: Arc::new(LocalLayerStore::new(&config.root)),
        volumes: Arc::new(LocalVolumeStore::new(&config.root)),
        network: Arc::new(LoopbackNetwork),
        labels: Arc::new(NoLabels),
    };

    let daemon = Daemon::new(
        Arc::new(config),
        Arc::new(backend),
        collaborators,
        Arc::new(LinuxPlatform::new(platform)),
    )
    .context("failed to initialize daemon")?;

    let shutdown = CancellationToken::new();
    let mut event_loop = daemon.spawn_event_loop(shutdown.clone());

    daemon.restore().await.context("failed to restore containers")?;
    info!("berthd ready");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        result = &mut event_loop => {
            match result {
                Ok(Ok(())) => warn!("event loop ended"),
                Ok(Err(e)) => error!(error = %e, "event loop failed"),
                Err(e) => error!(error = %e, "event loop panicked"),
            }
        }
    }

    daemon.shutdown().await;
    shutdown.cancel();
    if !event_loop.is_finished() {
        let _ = event_loop.await;
    }
    info!("berthd stopped");
    Ok(())
}

fn cmd_config(options: &Options) -> anyhow::Result<()> {
    let config = DaemonConfig::load(options.config.as_deref()).context("failed to load config")?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn cmd_version(_: &Options) -> anyhow::Result<()> {
    println!("berthd version {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn cmd_help(_: &Options) -> anyhow::Result<()> {
    println!(
        r#"berthd - container lifecycle daemon

USAGE:
    berthd <command> [options]

COMMANDS:
    daemon      Run the daemon (default)
    config      Print the effective configuration as YAML
    version     Show version info
    help        Show this help

OPTIONS:
    --config, -c <path>    YAML configuration file

ENVIRONMENT:
    BERTH_ROOT, BERTH_EXEC_ROOT, BERTH_BACKEND_SOCKET, BERTH_DEBUG=1
    BERTH_NOCLEAN=1        Keep bundle directories after exit
    BERTH_RAMDISK=<any>    Do not pivot_root (rootfs on ramdisk)
"#
    );
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    let (handler, options) = match parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("error: {:#}", e);
            let _ = cmd_help(&Options::default());
            return ExitCode::FAILURE;
        }
    };

    match handler(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
