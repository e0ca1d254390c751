//! In-process store backing the standalone daemon and tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::stats::{SeriesKind, StatsSnapshot, UserCounts};
use crate::traits::{NodeStore, SnapshotStore, SyncRecord};
use crate::types::{Node, NodeId, NodeStatus, OnlineSession, TrafficCounters, TrafficDelta};

/// Keeps nodes, per-user counters and snapshots in memory.
///
/// Active users are the distinct users with at least one online session
/// across all nodes.
pub struct MemoryStore {
    nodes: DashMap<NodeId, Node>,
    users: DashMap<String, TrafficCounters>,
    snapshots: RwLock<BTreeMap<(SeriesKind, DateTime<Utc>), StatsSnapshot>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            users: DashMap::new(),
            snapshots: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a store pre-populated with nodes
    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let store = Self::new();
        for node in nodes {
            store.insert_node(node);
        }
        store
    }

    /// Insert or replace a node record
    pub fn insert_node(&self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    /// Register end users so they count towards the total
    pub fn register_users<I, S>(&self, users: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for user in users {
            self.users.entry(user.into()).or_default();
        }
    }

    /// Cumulative traffic of one end user
    pub fn user_traffic(&self, user: &str) -> Option<TrafficCounters> {
        self.users.get(user).map(|r| *r)
    }

    /// Number of stored snapshots in a series
    pub async fn snapshot_count(&self, series: SeriesKind) -> usize {
        self.snapshots
            .read()
            .await
            .keys()
            .filter(|(s, _)| *s == series)
            .count()
    }

    fn update<F>(&self, id: &NodeId, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Node),
    {
        let mut node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.to_string()))?;
        f(&mut node);
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        let mut nodes: Vec<Node> = self.nodes.iter().map(|r| r.value().clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    async fn get_node(&self, id: &NodeId) -> Result<Node, StoreError> {
        self.nodes
            .get(id)
            .map(|r| r.value().clone())
            .ok_or_else(|| StoreError::NodeNotFound(id.to_string()))
    }

    async fn set_status(&self, id: &NodeId, status: NodeStatus) -> Result<(), StoreError> {
        self.update(id, |node| node.status = status)
    }

    async fn record_sync(&self, id: &NodeId, record: SyncRecord) -> Result<(), StoreError> {
        self.update(id, |node| {
            node.status = record.status;
            node.last_error = record.last_error;
            if let Some(at) = record.synced_at {
                node.last_sync = Some(at);
            }
        })
    }

    async fn set_last_error(&self, id: &NodeId, note: Option<String>) -> Result<(), StoreError> {
        self.update(id, |node| node.last_error = note)
    }

    async fn apply_traffic(
        &self,
        id: &NodeId,
        node_delta: TrafficDelta,
        per_user: &HashMap<String, TrafficDelta>,
    ) -> Result<(), StoreError> {
        self.update(id, |node| node.traffic += node_delta)?;
        for (user, delta) in per_user {
            *self.users.entry(user.clone()).or_default() += *delta;
        }
        Ok(())
    }

    async fn set_sessions(
        &self,
        id: &NodeId,
        sessions: Vec<OnlineSession>,
    ) -> Result<(), StoreError> {
        self.update(id, |node| {
            node.online_count = sessions.len() as u64;
            node.sessions = sessions;
        })
    }

    async fn user_counts(&self) -> Result<UserCounts, StoreError> {
        let online: HashSet<String> = self
            .nodes
            .iter()
            .flat_map(|r| {
                r.value()
                    .sessions
                    .iter()
                    .map(|s| s.user.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        let total = self.users.len().max(online.len()) as u64;
        Ok(UserCounts {
            total,
            active: online.len() as u64,
        })
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn upsert(&self, snapshot: StatsSnapshot) -> Result<(), StoreError> {
        self.snapshots
            .write()
            .await
            .insert((snapshot.series, snapshot.timestamp), snapshot);
        Ok(())
    }

    async fn range(
        &self,
        series: SeriesKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StatsSnapshot>, StoreError> {
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(self
            .snapshots
            .read()
            .await
            .range((series, start)..(series, end))
            .map(|(_, s)| s.clone())
            .collect())
    }

    async fn latest(&self, series: SeriesKind) -> Result<Option<StatsSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .await
            .iter()
            .rev()
            .find(|((s, _), _)| *s == series)
            .map(|(_, snap)| snap.clone()))
    }

    async fn delete_before(
        &self,
        series: SeriesKind,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut snapshots = self.snapshots.write().await;
        let before = snapshots.len();
        snapshots.retain(|(s, ts), _| *s != series || *ts >= cutoff);
        Ok(before - snapshots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn snapshot(series: SeriesKind, ts: DateTime<Utc>, online: u64) -> StatsSnapshot {
        StatsSnapshot {
            series,
            timestamp: ts,
            online,
            total_users: 0,
            active_users: 0,
            tx: 0,
            rx: 0,
            online_nodes: 0,
            total_nodes: 0,
            nodes: vec![],
        }
    }

    #[tokio::test]
    async fn test_upsert_overwrites_same_key() {
        let store = MemoryStore::new();
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();

        store.upsert(snapshot(SeriesKind::Fine, ts, 1)).await.unwrap();
        store.upsert(snapshot(SeriesKind::Fine, ts, 9)).await.unwrap();
        store.upsert(snapshot(SeriesKind::Hourly, ts, 4)).await.unwrap();

        assert_eq!(store.snapshot_count(SeriesKind::Fine).await, 1);
        let latest = store.latest(SeriesKind::Fine).await.unwrap().unwrap();
        assert_eq!(latest.online, 9);
    }

    #[tokio::test]
    async fn test_range_is_half_open_and_series_scoped() {
        let store = MemoryStore::new();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for i in 0..6 {
            store
                .upsert(snapshot(SeriesKind::Fine, base + Duration::minutes(5 * i), i as u64))
                .await
                .unwrap();
        }
        store.upsert(snapshot(SeriesKind::Hourly, base, 99)).await.unwrap();

        let got = store
            .range(SeriesKind::Fine, base + Duration::minutes(5), base + Duration::minutes(20))
            .await
            .unwrap();
        let online: Vec<u64> = got.iter().map(|s| s.online).collect();
        assert_eq!(online, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_delete_before() {
        let store = MemoryStore::new();
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        store.upsert(snapshot(SeriesKind::Fine, base, 0)).await.unwrap();
        store
            .upsert(snapshot(SeriesKind::Fine, base + Duration::hours(1), 0))
            .await
            .unwrap();
        store.upsert(snapshot(SeriesKind::Daily, base, 0)).await.unwrap();

        let removed = store
            .delete_before(SeriesKind::Fine, base + Duration::minutes(30))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.snapshot_count(SeriesKind::Fine).await, 1);
        assert_eq!(store.snapshot_count(SeriesKind::Daily).await, 1);
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let store = MemoryStore::new();
        let err = store
            .set_status(&NodeId::new("ghost"), NodeStatus::Online)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NodeNotFound(_)));
    }
}
