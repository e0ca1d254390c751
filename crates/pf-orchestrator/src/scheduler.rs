//! Background schedules for the fleet daemon
//!
//! Each loop ticks on its own interval and exits when the shared
//! cancellation token fires. A failing tick is logged and the loop carries
//! on with the next one.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use pf_core::stats::SeriesKind;

use crate::state::FleetState;

/// Spawn every scheduled loop, plus the one-shot startup sync when enabled
pub fn spawn_all(state: Arc<FleetState>, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    let mut handles = vec![
        tokio::spawn(run_telemetry_loop(Arc::clone(&state), cancel.clone())),
        tokio::spawn(run_snapshot_loop(Arc::clone(&state), cancel.clone())),
    ];
    if state.config.sync.sync_on_start {
        handles.push(tokio::spawn(sync_on_start(state, cancel)));
    }
    handles
}

fn period(series: SeriesKind) -> Duration {
    series.bucket().to_std().unwrap_or(Duration::from_secs(300))
}

/// Poll every node after the warmup delay, then every `poll_interval`
pub async fn run_telemetry_loop(state: Arc<FleetState>, cancel: CancellationToken) {
    let config = &state.config.telemetry;
    tracing::info!(
        "Starting telemetry loop (warmup: {:?}, interval: {:?})",
        config.warmup_delay,
        config.poll_interval
    );

    let mut interval =
        tokio::time::interval_at(Instant::now() + config.warmup_delay, config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match state.nodes.list_nodes().await {
                    Ok(nodes) => {
                        state.collector.poll_all(nodes, &cancel).await;
                    }
                    Err(e) => tracing::error!("Cannot list nodes for polling: {}", e),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Telemetry loop shutting down");
                break;
            }
        }
    }
}

/// Save fine snapshots, roll up hourly and daily, prune old points
pub async fn run_snapshot_loop(state: Arc<FleetState>, cancel: CancellationToken) {
    let fine_period = period(SeriesKind::Fine);
    let hourly_period = period(SeriesKind::Hourly);
    let daily_period = period(SeriesKind::Daily);

    let mut fine = tokio::time::interval(fine_period);
    let mut hourly = tokio::time::interval_at(Instant::now() + hourly_period, hourly_period);
    let mut daily = tokio::time::interval_at(Instant::now() + daily_period, daily_period);
    for interval in [&mut fine, &mut hourly, &mut daily] {
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    tracing::info!("Starting snapshot loop");

    loop {
        tokio::select! {
            _ = fine.tick() => {
                if let Err(e) = state.snapshots.save_fine(Utc::now()).await {
                    tracing::error!("Fine snapshot failed: {}", e);
                }
            }
            _ = hourly.tick() => {
                if let Err(e) = state.snapshots.save_hourly(Utc::now()).await {
                    tracing::error!("Hourly rollup failed: {}", e);
                }
            }
            _ = daily.tick() => {
                let now = Utc::now();
                if let Err(e) = state.snapshots.save_daily(now).await {
                    tracing::error!("Daily rollup failed: {}", e);
                }
                if let Err(e) = state.snapshots.cleanup(now).await {
                    tracing::error!("Snapshot cleanup failed: {}", e);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Snapshot loop shutting down");
                break;
            }
        }
    }
}

/// Push configuration to every active node once
pub async fn sync_on_start(state: Arc<FleetState>, cancel: CancellationToken) {
    let nodes = match state.nodes.list_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::error!("Cannot list nodes for startup sync: {}", e);
            return;
        }
    };

    tokio::select! {
        result = state.orchestrator.sync_all(nodes, &cancel) => {
            match result {
                Ok(outcomes) => {
                    let failed = outcomes.iter().filter(|o| !o.success).count();
                    tracing::info!("Startup sync done: {} nodes, {} failed", outcomes.len(), failed);
                }
                Err(e) => tracing::warn!("Startup sync not run: {}", e),
            }
        }
        _ = cancel.cancelled() => {
            tracing::info!("Startup sync interrupted by shutdown");
        }
    }
}
