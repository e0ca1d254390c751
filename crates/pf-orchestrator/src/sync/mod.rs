//! Configuration push to proxy nodes
//!
//! A sync writes the node's proxy config, validates it with the proxy's own
//! checker, restarts the service and confirms it is running. A config the
//! proxy rejects is rolled back before the service is touched.

pub mod config_gen;
pub mod port_hopping;

use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use pf_core::config::SyncConfig;
use pf_core::error::SyncError;
use pf_core::traits::{NodeStore, SyncRecord};
use pf_core::types::{Node, NodeId, NodeStatus, SyncOutcome};
use pf_pool::ssh::shell_quote;
use pf_pool::ConnectionPool;

use crate::batch::run_batched;

pub use config_gen::{check_custom_config, generate_config, render_config, CustomConfigError};

/// Pushes configuration to nodes and tracks their lifecycle status
pub struct SyncOrchestrator {
    pool: Arc<ConnectionPool>,
    store: Arc<dyn NodeStore>,
    config: SyncConfig,
    /// Set while a fleet-wide sync runs
    fleet_running: AtomicBool,
    /// Nodes with a sync in progress
    in_flight: DashMap<NodeId, ()>,
}

/// Clears the fleet flag when a fleet sync ends
struct FleetGuard<'a>(&'a AtomicBool);

impl Drop for FleetGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Releases a node's in-flight claim
struct NodeClaim<'a> {
    in_flight: &'a DashMap<NodeId, ()>,
    id: NodeId,
}

impl Drop for NodeClaim<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

impl SyncOrchestrator {
    /// Create a new orchestrator
    pub fn new(pool: Arc<ConnectionPool>, store: Arc<dyn NodeStore>, config: SyncConfig) -> Self {
        Self {
            pool,
            store,
            config,
            fleet_running: AtomicBool::new(false),
            in_flight: DashMap::new(),
        }
    }

    /// Get the sync configuration
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Whether a fleet-wide sync is in progress
    pub fn is_fleet_sync_running(&self) -> bool {
        self.fleet_running.load(Ordering::SeqCst)
    }

    /// Whether `id` has a sync in progress
    pub fn is_syncing(&self, id: &NodeId) -> bool {
        self.in_flight.contains_key(id)
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub(crate) fn command_timeout(&self) -> Duration {
        self.pool.config().command_timeout
    }

    fn claim(&self, id: &NodeId) -> Option<NodeClaim<'_>> {
        match self.in_flight.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Some(NodeClaim {
                    in_flight: &self.in_flight,
                    id: id.clone(),
                })
            }
        }
    }

    /// Push configuration to one node and bring its service up.
    ///
    /// Never fails: every error is folded into the returned outcome and the
    /// node's persisted status. May run while a fleet sync is in progress;
    /// only a second sync of the same node is refused.
    pub async fn sync_node(&self, node: &Node) -> SyncOutcome {
        let _claim = match self.claim(&node.id) {
            Some(claim) => claim,
            None => {
                tracing::warn!("Sync of {} skipped: already in progress", node.id);
                return SyncOutcome::new(node.id.clone())
                    .fail(node.status, SyncError::NodeBusy(node.id.to_string()).to_string());
            }
        };

        tracing::info!("Syncing node {} ({})", node.id, node.label());
        let mut outcome = SyncOutcome::new(node.id.clone());

        if let Err(e) = self.store.set_status(&node.id, NodeStatus::Syncing).await {
            tracing::warn!("Failed to mark {} as syncing: {}", node.id, e);
        }

        let outcome = match self.push(node, &mut outcome).await {
            Ok(()) => {
                tracing::info!("Node {} synced and online", node.id);
                outcome.succeed(NodeStatus::Online)
            }
            Err(e) => {
                tracing::warn!("Sync of {} failed: {}", node.id, e);
                outcome.fail(NodeStatus::Error, e.to_string())
            }
        };

        self.persist(&outcome).await;
        outcome
    }

    async fn push(&self, node: &Node, outcome: &mut SyncOutcome) -> Result<(), SyncError> {
        let rendered = render_config(&node.settings)
            .map_err(|e| SyncError::Validation(format!("cannot render config: {}", e)))?;
        outcome.used_custom_config = rendered.custom;
        match (&rendered.rejected, rendered.custom) {
            (_, true) => outcome.log("using custom config"),
            (Some(reason), false) => {
                tracing::warn!("Node {}: {}; using generated config", node.id, reason);
                outcome.log(format!("{}; using generated config", reason));
            }
            (None, false) => outcome.log("using generated config"),
        }

        let path = self.config.remote_config_path.as_str();
        let previous = self.pool.read_file(node, path).await?;
        match &previous {
            Some(bytes) => {
                self.pool
                    .write_file(node, &self.config.backup_path(), bytes)
                    .await?;
                outcome.log(format!("backed up {} bytes to {}", bytes.len(), self.config.backup_path()));
            }
            None => outcome.log("no existing config, nothing to back up"),
        }

        if let Err(e) = self.install(node, path, &rendered.text, outcome).await {
            self.restore(node, previous.as_deref(), outcome).await;
            return Err(e);
        }

        self.activate(node, outcome).await
    }

    /// Write the new config and run the proxy's checker against it
    async fn install(
        &self,
        node: &Node,
        path: &str,
        text: &str,
        outcome: &mut SyncOutcome,
    ) -> Result<(), SyncError> {
        if let Err(e) = self.pool.write_file(node, path, text.as_bytes()).await {
            outcome.log(format!("writing {} failed: {}", path, e));
            return Err(e.into());
        }
        outcome.log(format!("wrote {} bytes to {}", text.len(), path));

        let check = match self
            .pool
            .exec(node, &self.validate_command(), self.command_timeout())
            .await
        {
            Ok(check) => check,
            Err(e) => {
                outcome.log(format!("validation did not complete: {}", e));
                return Err(e.into());
            }
        };
        if !check.success() {
            let reason = match check.diagnostic() {
                "" => format!("validation exited with status {}", check.exit_code),
                diag => diag.to_string(),
            };
            outcome.log(format!("validation failed: {}", reason));
            return Err(SyncError::Validation(reason));
        }
        outcome.log("config validated");
        Ok(())
    }

    /// Put the previous config back after a rejected push
    async fn restore(&self, node: &Node, previous: Option<&[u8]>, outcome: &mut SyncOutcome) {
        let path = self.config.remote_config_path.as_str();
        let result = match previous {
            Some(bytes) => self.pool.write_file(node, path, bytes).await,
            None => self
                .pool
                .exec(node, &format!("rm -f {}", shell_quote(path)), self.command_timeout())
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) if previous.is_some() => outcome.log("restored previous config"),
            Ok(()) => outcome.log("removed rejected config"),
            Err(e) => {
                tracing::error!("Rollback on {} failed: {}", node.id, e);
                outcome.log(format!("rollback failed: {}", e));
            }
        }
    }

    /// Restart the service and confirm it reached the running state
    async fn activate(&self, node: &Node, outcome: &mut SyncOutcome) -> Result<(), SyncError> {
        let service = shell_quote(&self.config.service_name);
        let timeout = self.command_timeout();

        let restart = self
            .pool
            .exec(node, &format!("systemctl restart {}", service), timeout)
            .await?;
        if restart.success() {
            outcome.log(format!("restarted {}", self.config.service_name));
        } else {
            outcome.log(format!("restart exited with {}: {}", restart.exit_code, restart.diagnostic()));
        }

        tokio::time::sleep(self.config.settle_delay).await;

        let state = self
            .pool
            .exec(node, &format!("systemctl is-active {}", service), timeout)
            .await?;
        let state = state.stdout.trim().to_string();
        if state == "active" {
            outcome.log(format!("{} is active", self.config.service_name));
            return Ok(());
        }

        let state = if state.is_empty() { "unknown".to_string() } else { state };
        let mut message = format!("{} is {}", self.config.service_name, state);
        let journal = format!(
            "journalctl -u {} -n {} --no-pager",
            service, self.config.log_tail_lines
        );
        match self.pool.exec(node, &journal, timeout).await {
            Ok(tail) if !tail.stdout.trim().is_empty() => {
                message.push('\n');
                message.push_str(tail.stdout.trim_end());
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Journal unavailable on {}: {}", node.id, e),
        }
        Err(SyncError::Service(message))
    }

    fn validate_command(&self) -> String {
        self.config
            .validate_command
            .replace("{config}", &shell_quote(&self.config.remote_config_path))
    }

    async fn persist(&self, outcome: &SyncOutcome) {
        let record = SyncRecord {
            status: outcome.status,
            last_error: outcome.error.clone(),
            synced_at: outcome.success.then(Utc::now),
        };
        if let Err(e) = self.store.record_sync(&outcome.node_id, record).await {
            tracing::error!("Failed to record sync of {}: {}", outcome.node_id, e);
        }
    }

    /// Sync every active node in `nodes`, `batch_size` at a time.
    ///
    /// Rejects the call if another fleet sync is still running. Nodes whose
    /// task panicked are missing from the result.
    pub async fn sync_all(
        self: &Arc<Self>,
        nodes: Vec<Node>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SyncOutcome>, SyncError> {
        if self
            .fleet_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning);
        }
        let _guard = FleetGuard(&self.fleet_running);

        let active: Vec<Node> = nodes.into_iter().filter(|n| n.active).collect();
        tracing::info!(
            "Starting fleet sync of {} nodes (batch size {})",
            active.len(),
            self.config.batch_size
        );

        let report = run_batched(active, self.config.batch_size, cancel, |node| {
            let this = Arc::clone(self);
            async move { this.sync_node(&node).await }
        })
        .await;

        let ok = report.completed.iter().filter(|o| o.success).count();
        tracing::info!(
            "Fleet sync finished: {} ok, {} failed, {} crashed, {} skipped",
            ok,
            report.completed.len() - ok,
            report.failed,
            report.skipped
        );
        Ok(report.completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_core::config::PoolConfig;
    use pf_core::store::MemoryStore;
    use pf_pool::mock::{test_node, MockConnector};

    const PATH: &str = "/etc/hysteria/config.yaml";

    struct Harness {
        connector: Arc<MockConnector>,
        store: Arc<MemoryStore>,
        orchestrator: Arc<SyncOrchestrator>,
    }

    fn harness(nodes: &[&str]) -> Harness {
        harness_with(MockConnector::new(), nodes)
    }

    fn harness_with(connector: MockConnector, nodes: &[&str]) -> Harness {
        let connector = Arc::new(connector);
        let store = Arc::new(MemoryStore::with_nodes(nodes.iter().map(|id| test_node(id))));
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default(), connector.clone()));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            pool,
            store.clone(),
            SyncConfig::default(),
        ));
        Harness {
            connector,
            store,
            orchestrator,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_sync_goes_online() {
        let h = harness(&["n1"]);
        let host = h.connector.host("n1");
        host.put_file(PATH, b"old: config\n");
        host.respond_ok("systemctl is-active", "active\n");

        let node = test_node("n1");
        let outcome = h.orchestrator.sync_node(&node).await;

        assert!(outcome.success, "log: {:?}", outcome.log);
        assert_eq!(outcome.status, NodeStatus::Online);
        assert!(!outcome.used_custom_config);
        assert_eq!(host.file(&format!("{}.bak", PATH)).unwrap(), b"old: config\n");
        let written = String::from_utf8(host.file(PATH).unwrap()).unwrap();
        assert!(written.contains("trafficStats"));

        let commands = host.commands();
        assert!(commands
            .iter()
            .any(|c| c == "hysteria check -c '/etc/hysteria/config.yaml'"));
        assert!(commands
            .iter()
            .any(|c| c == "systemctl restart 'hysteria-server'"));

        let stored = h.store.get_node(&node.id).await.unwrap();
        assert_eq!(stored.status, NodeStatus::Online);
        assert!(stored.last_sync.is_some());
        assert!(stored.last_error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_restores_previous_bytes() {
        let h = harness(&["n1"]);
        let host = h.connector.host("n1");
        let original = b"listen: :443\n# exact bytes \xe2\x9c\x93\n".to_vec();
        host.put_file(PATH, &original);
        host.respond("hysteria check", 1, "", "invalid listen address");

        let outcome = h.orchestrator.sync_node(&test_node("n1")).await;

        assert!(!outcome.success);
        assert_eq!(outcome.status, NodeStatus::Error);
        assert!(outcome.error.as_deref().unwrap().contains("invalid listen address"));
        assert_eq!(host.file(PATH).unwrap(), original);
        assert!(!host.commands().iter().any(|c| c.contains("systemctl restart")));

        let stored = h.store.get_node(&NodeId::new("n1")).await.unwrap();
        assert_eq!(stored.status, NodeStatus::Error);
        assert!(stored.last_sync.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_timeout_restores_previous_bytes() {
        let h = harness(&["n1"]);
        let host = h.connector.host("n1");
        let original = b"listen: :443\nold: true\n".to_vec();
        host.put_file(PATH, &original);
        host.hang_commands_matching("hysteria check");

        let outcome = h.orchestrator.sync_node(&test_node("n1")).await;

        assert!(!outcome.success);
        assert_eq!(outcome.status, NodeStatus::Error);
        assert_eq!(host.file(PATH).unwrap(), original);
        assert!(outcome.log.iter().any(|l| l == "restored previous config"));
        assert!(!host.commands().iter().any(|c| c.contains("systemctl restart")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_torn_write_restores_previous_bytes() {
        let h = harness(&["n1"]);
        let host = h.connector.host("n1");
        let original = b"listen: :443\nold: true\n".to_vec();
        host.put_file(PATH, &original);
        host.tear_next_write(PATH);

        let outcome = h.orchestrator.sync_node(&test_node("n1")).await;

        assert_eq!(outcome.status, NodeStatus::Error);
        assert_eq!(host.file(PATH).unwrap(), original);
        assert!(!host.commands().iter().any(|c| c.contains("hysteria check")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_without_previous_removes_file() {
        let h = harness(&["n1"]);
        let host = h.connector.host("n1");
        host.respond("hysteria check", 2, "bad config", "");

        let outcome = h.orchestrator.sync_node(&test_node("n1")).await;

        assert_eq!(outcome.status, NodeStatus::Error);
        assert!(host
            .commands()
            .iter()
            .any(|c| c == "rm -f '/etc/hysteria/config.yaml'"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_service_reports_journal_tail() {
        let h = harness(&["n1"]);
        let host = h.connector.host("n1");
        host.respond("systemctl is-active", 3, "failed\n", "");
        host.respond_ok("journalctl", "line one\nbind: address already in use\n");

        let outcome = h.orchestrator.sync_node(&test_node("n1")).await;

        assert_eq!(outcome.status, NodeStatus::Error);
        let error = outcome.error.unwrap();
        assert!(error.contains("hysteria-server is failed"));
        assert!(error.contains("address already in use"));
        assert!(host
            .commands()
            .iter()
            .any(|c| c == "journalctl -u 'hysteria-server' -n 20 --no-pager"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_marks_error() {
        let h = harness(&["n1"]);
        h.connector.reject_auth(true);

        let outcome = h.orchestrator.sync_node(&test_node("n1")).await;

        assert_eq!(outcome.status, NodeStatus::Error);
        assert!(outcome.error.unwrap().contains("Authentication failed"));
        let stored = h.store.get_node(&NodeId::new("n1")).await.unwrap();
        assert_eq!(stored.status, NodeStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_config_written_verbatim() {
        let h = harness(&["n1"]);
        let host = h.connector.host("n1");
        host.respond_ok("systemctl is-active", "active");

        let custom = "listen: :8443\ntls:\n  cert: /c.pem\n  key: /k.pem\n";
        let mut node = test_node("n1");
        node.settings.use_custom_config = true;
        node.settings.custom_config = Some(custom.into());

        let outcome = h.orchestrator.sync_node(&node).await;
        assert!(outcome.success);
        assert!(outcome.used_custom_config);
        assert_eq!(host.file(PATH).unwrap(), custom.as_bytes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sync_of_same_node_is_rejected() {
        let h = harness_with(
            MockConnector::new().with_exec_delay(Duration::from_millis(50)),
            &["n1"],
        );
        h.connector.host("n1").respond_ok("systemctl is-active", "active");
        let node = test_node("n1");

        let (first, second) = tokio::join!(
            h.orchestrator.sync_node(&node),
            h.orchestrator.sync_node(&node)
        );

        let (ok, busy) = if first.success { (first, second) } else { (second, first) };
        assert!(ok.success);
        assert!(!busy.success);
        assert_eq!(busy.status, NodeStatus::Offline);
        assert!(busy.error.unwrap().contains("already syncing"));
        assert!(!h.orchestrator.is_syncing(&node.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_sync_during_fleet_sync() {
        let h = harness_with(
            MockConnector::new().with_exec_delay(Duration::from_millis(50)),
            &["n1", "n2"],
        );
        for id in ["n1", "n2"] {
            h.connector.host(id).respond_ok("systemctl is-active", "active");
        }
        let cancel = CancellationToken::new();

        let (fleet, single) = tokio::join!(
            h.orchestrator.sync_all(vec![test_node("n1")], &cancel),
            async {
                tokio::task::yield_now().await;
                assert!(h.orchestrator.is_fleet_sync_running());
                h.orchestrator.sync_node(&test_node("n2")).await
            }
        );

        assert!(fleet.unwrap()[0].success);
        assert!(single.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_fleet_sync_rejected() {
        let h = harness_with(
            MockConnector::new().with_exec_delay(Duration::from_millis(50)),
            &["n1", "n2"],
        );
        let nodes = vec![test_node("n1"), test_node("n2")];
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            h.orchestrator.sync_all(nodes.clone(), &cancel),
            async {
                tokio::task::yield_now().await;
                h.orchestrator.sync_all(nodes.clone(), &cancel).await
            }
        );

        assert_eq!(first.unwrap().len(), 2);
        assert!(matches!(second, Err(SyncError::AlreadyRunning)));
        assert!(!h.orchestrator.is_fleet_sync_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_all_skips_inactive_nodes() {
        let h = harness(&["n1", "n2"]);
        let mut idle = test_node("n2");
        idle.active = false;

        let outcomes = h
            .orchestrator
            .sync_all(vec![test_node("n1"), idle], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].node_id, NodeId::new("n1"));
        assert!(h.connector.host("n2").commands().is_empty());
    }
}
