//! Persistence traits implemented by the admin panel's store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::StoreError;
use crate::stats::{SeriesKind, StatsSnapshot, UserCounts};
use crate::types::{Node, NodeId, NodeStatus, OnlineSession, TrafficDelta};

/// Final state of a sync attempt, persisted on the node record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub status: NodeStatus,
    pub last_error: Option<String>,
    /// Set only when the sync succeeded
    pub synced_at: Option<DateTime<Utc>>,
}

/// Node records: status, counters and sessions
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// All known nodes
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;

    /// A single node
    async fn get_node(&self, id: &NodeId) -> Result<Node, StoreError>;

    /// Set only the status field
    async fn set_status(&self, id: &NodeId, status: NodeStatus) -> Result<(), StoreError>;

    /// Persist the result of a sync attempt
    async fn record_sync(&self, id: &NodeId, record: SyncRecord) -> Result<(), StoreError>;

    /// Set or clear the soft error note without touching status
    async fn set_last_error(&self, id: &NodeId, note: Option<String>) -> Result<(), StoreError>;

    /// Increment node and per-user cumulative traffic counters
    async fn apply_traffic(
        &self,
        id: &NodeId,
        node_delta: TrafficDelta,
        per_user: &HashMap<String, TrafficDelta>,
    ) -> Result<(), StoreError>;

    /// Replace the node's current session list
    async fn set_sessions(&self, id: &NodeId, sessions: Vec<OnlineSession>)
        -> Result<(), StoreError>;

    /// Total and currently active end users
    async fn user_counts(&self) -> Result<UserCounts, StoreError>;
}

/// Snapshot documents keyed by `(series, timestamp)`
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert or overwrite the snapshot with the same key
    async fn upsert(&self, snapshot: StatsSnapshot) -> Result<(), StoreError>;

    /// Snapshots with `start <= timestamp < end`, oldest first
    async fn range(
        &self,
        series: SeriesKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StatsSnapshot>, StoreError>;

    /// Most recent snapshot of a series
    async fn latest(&self, series: SeriesKind) -> Result<Option<StatsSnapshot>, StoreError>;

    /// Delete snapshots strictly older than `cutoff`, returning how many were removed
    async fn delete_before(
        &self,
        series: SeriesKind,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}
