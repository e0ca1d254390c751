//! Multi-resolution fleet snapshots
//!
//! Fine snapshots capture the fleet every five minutes. Hourly snapshots
//! roll up the fine ones of the last completed hour, daily snapshots the
//! hourly ones of the last completed day. Every write is an upsert on
//! `(series, bucket start)`, so re-running a save for the same bucket
//! replaces rather than duplicates.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use pf_core::error::TelemetryError;
use pf_core::stats::{FleetSummary, NodeBreakdown, SeriesKind, StatsSnapshot, UserCounts};
use pf_core::time::{bucket_start, previous_bucket};
use pf_core::traits::{NodeStore, SnapshotStore};
use pf_core::types::{Node, NodeStatus, TrafficDelta};

use super::collector::TelemetryCollector;
use super::reconcile::TrafficReconciler;

/// Writes, rolls up and prunes snapshot series
pub struct SnapshotService {
    nodes: Arc<dyn NodeStore>,
    snapshots: Arc<dyn SnapshotStore>,
    reconciler: TrafficReconciler,
    /// Refreshes node state before a rollup that has no source points
    collector: Option<Arc<TelemetryCollector>>,
}

impl SnapshotService {
    /// Create a new snapshot service
    pub fn new(nodes: Arc<dyn NodeStore>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self {
            nodes,
            snapshots,
            reconciler: TrafficReconciler::new(),
            collector: None,
        }
    }

    /// Poll the fleet through `collector` when a rollup falls back to live state
    pub fn with_collector(mut self, collector: Arc<TelemetryCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    /// Baselines used for fine snapshot deltas
    pub fn reconciler(&self) -> &TrafficReconciler {
        &self.reconciler
    }

    /// Capture the fleet into the fine bucket containing `now`.
    ///
    /// Traffic is the growth of each node's cumulative counters since the
    /// previous fine snapshot; the first capture after startup reports zero.
    pub async fn save_fine(&self, now: DateTime<Utc>) -> Result<StatsSnapshot, TelemetryError> {
        let nodes = self.nodes.list_nodes().await?;
        let users = self.nodes.user_counts().await?;

        let mut traffic = TrafficDelta::default();
        for node in &nodes {
            traffic += self.reconciler.observe(&node.id, node.traffic);
        }

        let snapshot = live_snapshot(
            SeriesKind::Fine,
            bucket_start(SeriesKind::Fine, now),
            &nodes,
            users,
            traffic,
        );
        self.snapshots.upsert(snapshot.clone()).await?;
        tracing::debug!(
            "Saved fine snapshot {}: {} online, {} tx, {} rx",
            snapshot.timestamp,
            snapshot.online,
            snapshot.tx,
            snapshot.rx
        );
        Ok(snapshot)
    }

    /// Roll the fine snapshots of the last completed hour into one
    pub async fn save_hourly(&self, now: DateTime<Utc>) -> Result<StatsSnapshot, TelemetryError> {
        self.rollup(SeriesKind::Hourly, now).await
    }

    /// Roll the hourly snapshots of the last completed day into one
    pub async fn save_daily(&self, now: DateTime<Utc>) -> Result<StatsSnapshot, TelemetryError> {
        self.rollup(SeriesKind::Daily, now).await
    }

    async fn rollup(
        &self,
        series: SeriesKind,
        now: DateTime<Utc>,
    ) -> Result<StatsSnapshot, TelemetryError> {
        let Some(source) = series.source() else {
            return self.save_fine(now).await;
        };
        let start = previous_bucket(series, now);
        let end = start + series.bucket();
        let points = self.snapshots.range(source, start, end).await?;

        let snapshot = match aggregate(series, start, &points) {
            Some(snapshot) => snapshot,
            None => {
                tracing::info!(
                    "No {} snapshots for {} bucket {}; using live state",
                    source,
                    series,
                    start
                );
                self.refresh().await?;
                let nodes = self.nodes.list_nodes().await?;
                let users = self.nodes.user_counts().await?;
                live_snapshot(series, start, &nodes, users, TrafficDelta::default())
            }
        };

        self.snapshots.upsert(snapshot.clone()).await?;
        tracing::info!(
            "Saved {} snapshot {} from {} {} points",
            series,
            start,
            points.len(),
            source
        );
        Ok(snapshot)
    }

    /// Poll every node so live state is current; a no-op without a collector
    async fn refresh(&self) -> Result<(), TelemetryError> {
        let Some(collector) = &self.collector else {
            return Ok(());
        };
        let nodes = self.nodes.list_nodes().await?;
        let reports = collector.poll_all(nodes, &CancellationToken::new()).await;
        tracing::debug!("Refreshed {} nodes for live rollup", reports.len());
        Ok(())
    }

    /// Delete snapshots older than each series' retention
    pub async fn cleanup(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<SeriesKind, usize>, TelemetryError> {
        let mut removed = BTreeMap::new();
        for series in SeriesKind::ALL {
            let cutoff = now - series.retention();
            let count = self.snapshots.delete_before(series, cutoff).await?;
            if count > 0 {
                tracing::info!("Pruned {} {} snapshots older than {}", count, series, cutoff);
            }
            removed.insert(series, count);
        }
        Ok(removed)
    }

    /// Live fleet totals plus the latest fine snapshot
    pub async fn summary(&self) -> Result<FleetSummary, TelemetryError> {
        let nodes = self.nodes.list_nodes().await?;
        let users = self.nodes.user_counts().await?;
        let latest = self.snapshots.latest(SeriesKind::Fine).await?;

        let count = |status: NodeStatus| nodes.iter().filter(|n| n.status == status).count() as u64;
        let mut traffic = TrafficDelta::default();
        for node in &nodes {
            traffic += node.traffic;
        }

        Ok(FleetSummary {
            total_nodes: nodes.len() as u64,
            online_nodes: count(NodeStatus::Online),
            error_nodes: count(NodeStatus::Error),
            syncing_nodes: count(NodeStatus::Syncing),
            online_users: nodes.iter().map(|n| n.online_count).sum(),
            users,
            traffic,
            latest,
        })
    }

    /// Stored snapshots with `start <= timestamp < end`, oldest first
    pub async fn series(
        &self,
        kind: SeriesKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StatsSnapshot>, TelemetryError> {
        Ok(self.snapshots.range(kind, start, end).await?)
    }
}

/// Snapshot of the current node state
fn live_snapshot(
    series: SeriesKind,
    timestamp: DateTime<Utc>,
    nodes: &[Node],
    users: UserCounts,
    traffic: TrafficDelta,
) -> StatsSnapshot {
    StatsSnapshot {
        series,
        timestamp,
        online: nodes.iter().map(|n| n.online_count).sum(),
        total_users: users.total,
        active_users: users.active,
        tx: traffic.tx,
        rx: traffic.rx,
        online_nodes: nodes
            .iter()
            .filter(|n| n.status == NodeStatus::Online)
            .count() as u64,
        total_nodes: nodes.len() as u64,
        nodes: nodes
            .iter()
            .map(|n| NodeBreakdown {
                id: n.id.clone(),
                name: n.label().to_string(),
                online: n.online_count,
                status: n.status,
            })
            .collect(),
    }
}

/// Combine `points` (oldest first) into one snapshot; `None` when empty.
///
/// Gauges are averaged, traffic is summed, counts and the node breakdown
/// come from the newest point.
fn aggregate(
    series: SeriesKind,
    timestamp: DateTime<Utc>,
    points: &[StatsSnapshot],
) -> Option<StatsSnapshot> {
    let last = points.last()?;
    Some(StatsSnapshot {
        series,
        timestamp,
        online: rounded_mean(points.iter().map(|p| p.online)),
        total_users: last.total_users,
        active_users: last.active_users,
        tx: points.iter().fold(0u64, |acc, p| acc.saturating_add(p.tx)),
        rx: points.iter().fold(0u64, |acc, p| acc.saturating_add(p.rx)),
        online_nodes: rounded_mean(points.iter().map(|p| p.online_nodes)),
        total_nodes: last.total_nodes,
        nodes: last.nodes.clone(),
    })
}

/// Mean rounded half away from zero
fn rounded_mean(values: impl Iterator<Item = u64>) -> u64 {
    let (sum, n) = values.fold((0u128, 0u128), |(s, n), v| (s + v as u128, n + 1));
    if n == 0 {
        return 0;
    }
    (sum as f64 / n as f64).round() as u64
}
