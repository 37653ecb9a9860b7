//! vbalancer binary.
//!
//! Loads the YAML config, starts the proxy and runs until Ctrl+C or
//! SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use vbalancer::config::{Config, DEFAULT_CONFIG_FILE};
use vbalancer::{logging, ProxyController};

/// TCP reverse proxy and round-robin load balancer.
#[derive(Debug, Parser)]
#[command(name = "vbalancer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file. Relative names are searched in ./, ./config/ and parent config dirs.
    #[arg(long, env = "VBALANCER_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Listening port, overrides `proxy.default_port`.
    #[arg(long, env = "VBALANCER_PROXY_PORT")]
    port: Option<String>,

    /// Log level, overrides `logger.level`.
    #[arg(long, env = "VBALANCER_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "vbalancer failed");
            eprintln!("vbalancer: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(&cli.config)?;
    if let Some(port) = &cli.port {
        config.proxy.override_port(port)?;
    }

    logging::init(&config.logger, cli.log_level.as_deref())?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        peer_count = config.peers.len(),
        "Starting vbalancer"
    );

    let proxy = ProxyController::new(config)?
        .start()
        .await
        .context("failed to start proxy")?;

    info!(bind_addr = %proxy.local_addr(), "vbalancer is ready");

    wait_for_signal().await?;
    info!("Received shutdown signal");

    proxy.shutdown().await?;
    info!("vbalancer shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl+C")?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")
}
