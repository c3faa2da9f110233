//! ptybridge
//!
//! Runs a shell on a pseudo-terminal and serves it over WebSocket until
//! interrupted.

use std::path::PathBuf;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ptybridge::{SessionBridge, SessionConfig};

/// Pseudo-terminal session bridge
///
/// Spawns COMMAND on a PTY when the first client connects and relays the
/// terminal over WebSocket
#[derive(Parser, Debug)]
#[command(name = "ptybridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Command to run on the terminal
    #[arg(short, long)]
    command: Option<String>,

    /// Arguments for the command, split like a POSIX shell would
    #[arg(short, long, allow_hyphen_values = true)]
    args: Option<String>,

    /// Bind address
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// TOML config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)?,
            None => SessionConfig::default(),
        };

        if let Some(command) = self.command {
            config.command = command;
        }
        if let Some(raw) = self.args {
            config = config.with_args_str(&raw)?;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    FmtSubscriber::builder()
        .with_env_filter(log_filter(args.verbose))
        .with_target(false)
        .compact()
        .init();

    info!("ptybridge v{}", env!("CARGO_PKG_VERSION"));

    let config = args.into_config()?;
    info!(command = %config.command, args = ?config.args, "Session command");

    let bridge = SessionBridge::new(config);
    bridge.start().await?;
    info!("Connect a terminal client to {}", bridge.get_url());

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");
    bridge.stop().await;

    info!("Bridge shutdown complete");
    Ok(())
}

/// `RUST_LOG` when set, otherwise debug or info depending on `--verbose`
fn log_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    })
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
