//! nixbridge daemon
//!
//! Serves a fixed local command (by default `nix daemon --stdio`) to any SSH
//! client that sends an exec request.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nb_core::config::{self, DaemonConfig};
use nb_daemon::server::{generate_host_key, SshServer};
use nb_daemon::DaemonState;

#[derive(Parser)]
#[command(name = "nixbridge")]
#[command(about = "Expose a fixed local command over unauthenticated SSH exec")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, host:port (overrides config, default 127.0.0.1:2022)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs share stderr with the bridged processes
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("nixbridge starting...");

    let mut config = load_config(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen_address = listen;
    }
    config.validate().context("Invalid configuration")?;

    tracing::info!("Bridged command: {:?}", config.command);

    let host_key = generate_host_key()?;
    let state = Arc::new(DaemonState::new(config));

    let cancel = CancellationToken::new();
    tokio::spawn(watch_signals(cancel.clone()));

    let server = SshServer::bind(host_key, state, cancel).await?;
    server.run().await?;

    tracing::info!("nixbridge stopped");
    Ok(())
}

/// Load the explicit config file, else the default one if present
fn load_config(path: Option<&std::path::Path>) -> Result<DaemonConfig> {
    if let Some(path) = path {
        return config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        config::load_config(&default_path)
            .with_context(|| format!("Failed to load config from {:?}", default_path))
    } else {
        tracing::info!("Using default configuration");
        Ok(DaemonConfig::default())
    }
}

/// Cancel the accept loop on Ctrl+C or SIGTERM
async fn watch_signals(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }

    cancel.cancel();
}
