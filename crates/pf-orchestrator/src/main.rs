//! proxy-fleet Orchestrator Daemon
//!
//! Drives a fleet of proxy nodes: keeps SSH sessions warm, polls traffic
//! stats, writes snapshot series and optionally pushes configuration on
//! startup.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pf_core::config::{self, FleetConfig};
use pf_orchestrator::{scheduler, FleetState};

#[derive(Parser)]
#[command(name = "pf-orchestrator")]
#[command(about = "proxy-fleet orchestrator daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "PF_CONFIG")]
    config: Option<PathBuf>,

    /// Push configuration to every active node at startup (overrides config)
    #[arg(long)]
    sync_on_start: bool,

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

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("proxy-fleet orchestrator starting...");

    // Load configuration
    let mut config: FleetConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                FleetConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            FleetConfig::default()
        }
    };
    if args.sync_on_start {
        config.sync.sync_on_start = true;
    }
    config.validate().context("Invalid configuration")?;

    if config.nodes.is_empty() {
        tracing::warn!("No nodes configured - nothing to manage");
    } else {
        tracing::info!("Managing {} nodes", config.nodes.len());
    }
    if !config.pool.enabled {
        tracing::warn!("Connection pool disabled - every operation opens a fresh session");
    }

    let state = Arc::new(FleetState::new(config).context("Failed to initialize fleet state")?);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let maintenance = tokio::spawn(pf_pool::run_maintenance(
        Arc::clone(state.connection_pool()),
        cancel.clone(),
    ));
    let loops = scheduler::spawn_all(Arc::clone(&state), cancel.clone());

    cancel.cancelled().await;

    for handle in loops {
        if let Err(e) = handle.await {
            tracing::error!("Scheduled task failed: {}", e);
        }
    }
    // Maintenance closes every pooled session on its way out
    if let Err(e) = maintenance.await {
        tracing::error!("Pool maintenance failed: {}", e);
        state.connection_pool().shutdown().await;
    }

    tracing::info!("Orchestrator shutdown complete");
    Ok(())
}
