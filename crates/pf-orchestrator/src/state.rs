//! Fleet state container
//!
//! Every long-lived component is created here once and handed out by
//! reference; nothing in the crate reaches for a global.

use std::sync::Arc;

use pf_core::config::FleetConfig;
use pf_core::error::TelemetryError;
use pf_core::store::MemoryStore;
use pf_core::traits::{Connector, NodeStore, SnapshotStore};
use pf_pool::{ConnectionPool, SshConnector};

use crate::sync::SyncOrchestrator;
use crate::telemetry::{HttpStatsClient, SnapshotService, StatsEndpoint, TelemetryCollector};

/// Shared state for the fleet daemon
pub struct FleetState {
    /// Configuration
    pub config: FleetConfig,
    /// Connection pool
    pub pool: Arc<ConnectionPool>,
    /// Node records
    pub nodes: Arc<dyn NodeStore>,
    /// Snapshot series
    pub snapshot_store: Arc<dyn SnapshotStore>,
    /// Configuration push
    pub orchestrator: Arc<SyncOrchestrator>,
    /// Stats polling
    pub collector: Arc<TelemetryCollector>,
    /// Snapshot rollups
    pub snapshots: Arc<SnapshotService>,
}

impl FleetState {
    /// Wire the production stack: SSH transport, HTTP stats client and an
    /// in-memory store seeded with the configured nodes
    pub fn new(config: FleetConfig) -> Result<Self, TelemetryError> {
        let store = Arc::new(MemoryStore::with_nodes(config.nodes()));
        let endpoint = Arc::new(HttpStatsClient::new(config.telemetry.request_timeout)?);
        Ok(Self::with_parts(
            config,
            Arc::new(SshConnector::new()),
            endpoint,
            store.clone(),
            store,
        ))
    }

    /// Wire the components around caller-supplied transports and stores
    pub fn with_parts(
        config: FleetConfig,
        connector: Arc<dyn Connector>,
        endpoint: Arc<dyn StatsEndpoint>,
        nodes: Arc<dyn NodeStore>,
        snapshot_store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let pool = Arc::new(ConnectionPool::new(config.pool.clone(), connector));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            Arc::clone(&pool),
            Arc::clone(&nodes),
            config.sync.clone(),
        ));
        let collector = Arc::new(TelemetryCollector::new(
            endpoint,
            Arc::clone(&nodes),
            config.telemetry.clone(),
        ));
        let snapshots = Arc::new(
            SnapshotService::new(Arc::clone(&nodes), Arc::clone(&snapshot_store))
                .with_collector(Arc::clone(&collector)),
        );

        Self {
            config,
            pool,
            nodes,
            snapshot_store,
            orchestrator,
            collector,
            snapshots,
        }
    }

    /// Get the connection pool
    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Get the sync orchestrator
    pub fn sync_orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_core::config::NodeProfile;
    use pf_pool::mock::test_node;

    #[tokio::test]
    async fn test_new_seeds_store_from_config() {
        let node = test_node("edge-1");
        let mut config = FleetConfig::default();
        config.nodes.insert(
            "edge-1".into(),
            NodeProfile {
                name: node.name.clone(),
                ssh: node.ssh.clone(),
                settings: node.settings.clone(),
                stats_url: node.stats_url.clone(),
                active: true,
            },
        );

        let state = FleetState::new(config).unwrap();

        let nodes = state.nodes.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id.as_str(), "edge-1");
        assert!(state.connection_pool().is_empty().await);
        assert!(!state.sync_orchestrator().is_fleet_sync_running());
    }
}
