//! Periodic traffic and session polling
//!
//! Telemetry is fail-soft: an unreachable or misbehaving stats endpoint is
//! recorded as a note on the node and never changes its status.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use pf_core::config::TelemetryConfig;
use pf_core::traits::NodeStore;
use pf_core::types::{Node, NodeId, TrafficDelta};

use crate::batch::run_batched;

use super::client::StatsEndpoint;

/// Prefix marking `last_error` notes written by telemetry
pub const TELEMETRY_NOTE_PREFIX: &str = "telemetry: ";

/// Result of polling one node
#[derive(Debug, Clone)]
pub struct PollReport {
    pub node_id: NodeId,
    /// Sum of the per-user deltas applied
    pub traffic: TrafficDelta,
    /// Users with a non-zero delta
    pub users: usize,
    /// Sessions online, when the session fetch succeeded
    pub online: Option<usize>,
    /// Problems encountered, empty on a full success
    pub errors: Vec<String>,
}

impl PollReport {
    /// Empty report for `node_id`
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            traffic: TrafficDelta::default(),
            users: 0,
            online: None,
            errors: Vec::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Polls stats endpoints and folds the results into the node store
pub struct TelemetryCollector {
    endpoint: Arc<dyn StatsEndpoint>,
    store: Arc<dyn NodeStore>,
    config: TelemetryConfig,
}

impl TelemetryCollector {
    /// Create a new collector
    pub fn new(
        endpoint: Arc<dyn StatsEndpoint>,
        store: Arc<dyn NodeStore>,
        config: TelemetryConfig,
    ) -> Self {
        Self {
            endpoint,
            store,
            config,
        }
    }

    /// Get the telemetry configuration
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Poll one node for traffic and sessions
    pub async fn poll_node(&self, node: &Node) -> PollReport {
        let mut report = PollReport::new(node.id.clone());

        match self.endpoint.fetch_traffic(node, true).await {
            Ok(per_user) => {
                let mut total = TrafficDelta::default();
                for delta in per_user.values() {
                    total += *delta;
                }
                report.users = per_user.values().filter(|d| !d.is_zero()).count();
                report.traffic = total;

                if let Err(e) = self.store.apply_traffic(&node.id, total, &per_user).await {
                    report.errors.push(format!("traffic not recorded: {}", e));
                }
            }
            Err(e) => report.errors.push(format!("traffic: {}", e)),
        }

        match self.endpoint.fetch_sessions(node).await {
            Ok(sessions) => {
                report.online = Some(sessions.len());
                if let Err(e) = self.store.set_sessions(&node.id, sessions).await {
                    report.errors.push(format!("sessions not recorded: {}", e));
                }
            }
            Err(e) => report.errors.push(format!("sessions: {}", e)),
        }

        self.record_note(node, &report).await;
        report
    }

    /// Write or clear this collector's soft error note
    async fn record_note(&self, node: &Node, report: &PollReport) {
        let note = if report.is_ok() {
            let ours = node
                .last_error
                .as_deref()
                .is_some_and(|e| e.starts_with(TELEMETRY_NOTE_PREFIX));
            if !ours {
                return;
            }
            None
        } else {
            let joined = report.errors.join("; ");
            tracing::warn!("Telemetry poll of {} degraded: {}", node.id, joined);
            Some(format!("{}{}", TELEMETRY_NOTE_PREFIX, joined))
        };

        if let Err(e) = self.store.set_last_error(&node.id, note).await {
            tracing::error!("Failed to update telemetry note for {}: {}", node.id, e);
        }
    }

    /// Poll every active node, `batch_size` at a time
    pub async fn poll_all(
        self: &Arc<Self>,
        nodes: Vec<Node>,
        cancel: &CancellationToken,
    ) -> Vec<PollReport> {
        let active: Vec<Node> = nodes.into_iter().filter(|n| n.active).collect();
        let total = active.len();

        let report = run_batched(active, self.config.batch_size, cancel, |node| {
            let this = Arc::clone(self);
            async move { this.poll_node(&node).await }
        })
        .await;

        let ok = report.completed.iter().filter(|r| r.is_ok()).count();
        tracing::info!("Polled {} nodes: {} ok, {} degraded", total, ok, total - ok);
        report.completed
    }
}
