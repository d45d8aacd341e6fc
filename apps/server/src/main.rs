//! Pulseguard Server - standalone headless coordination server.
//!
//! Hosts the connection plane, anomaly pipeline, episode engine, and
//! per-device session engine as a background daemon.

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pulseguard_core::{bootstrap_services, start_server, AppState};
use tokio::signal;

use crate::config::ServerConfig;

/// Pulseguard Server - real-time health-event coordination for wearables.
#[derive(Parser, Debug)]
#[command(name = "pulseguard-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "PULSEGUARD_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// Bind port (overrides config file; 0 = auto-allocate).
    #[arg(short = 'p', long, env = "PULSEGUARD_BIND_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("Pulseguard Server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = ServerConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.core.preferred_port = port;
    }

    if !config.core.agent.agent_available() {
        log::warn!("Agent credentials not configured - conversational features degraded to no-op");
    }
    if config.core.analyst.api_key.is_empty() {
        log::info!("Analyst key not configured - episode fusion uses threshold fallback");
    }

    let services = bootstrap_services(config.core).context("Failed to bootstrap services")?;
    log::info!("Services bootstrapped successfully");

    services.start_background_tasks();
    log::info!("Background tasks started");

    let app_state = AppState::new(&services);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(app_state).await {
            log::error!("Server error: {}", e);
        }
    });

    shutdown_signal().await;
    log::info!("Shutdown signal received, cleaning up...");

    services.shutdown().await;
    server_handle.abort();

    log::info!("Shutdown complete");
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
