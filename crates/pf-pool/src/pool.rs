//! Connection pool implementation
//!
//! The pool keeps zero or one live connection per node. Each node has a slot
//! guarded by an async mutex that is held across establishment, so concurrent
//! callers for a cold node wait for a single handshake instead of racing.
//! Command execution and file transfer release the slot lock before running,
//! letting callers share the connection while it is in use.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use pf_core::config::PoolConfig;
use pf_core::error::ConnectionError;
use pf_core::traits::{Connector, RemoteShell};
use pf_core::types::{ExecOutput, Node, NodeId};

use crate::backoff::ExponentialBackoff;

type Slot = Arc<tokio::sync::Mutex<Option<Arc<PooledConnection>>>>;

/// A live remote shell plus pool bookkeeping
pub struct PooledConnection {
    node_id: NodeId,
    shell: Arc<dyn RemoteShell>,
    created_at: Instant,
    last_used: Mutex<Instant>,
    use_count: AtomicU64,
    keepalive_failures: AtomicU32,
}

impl PooledConnection {
    fn new(node_id: NodeId, shell: Arc<dyn RemoteShell>) -> Self {
        let now = Instant::now();
        Self {
            node_id,
            shell,
            created_at: now,
            last_used: Mutex::new(now),
            use_count: AtomicU64::new(0),
            keepalive_failures: AtomicU32::new(0),
        }
    }

    /// Node this connection belongs to
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The underlying shell
    pub fn shell(&self) -> Arc<dyn RemoteShell> {
        Arc::clone(&self.shell)
    }

    /// When the connection was established
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Number of times the connection was handed out
    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    /// Time since the connection was last handed out or finished an operation
    pub fn idle_for(&self) -> Duration {
        let last = *self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        last.elapsed()
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn mark_used(&self) {
        self.use_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    fn is_healthy(&self) -> bool {
        !self.shell.is_closed()
    }
}

/// Point-in-time view of one pooled connection
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub node_id: NodeId,
    pub age: Duration,
    pub idle: Duration,
    pub use_count: u64,
}

/// Pool of remote shell connections to nodes
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    /// Slots indexed by node ID
    slots: DashMap<NodeId, Slot>,
}

impl ConnectionPool {
    /// Create a new empty connection pool
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config,
            connector,
            slots: DashMap::new(),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether connections are cached at all
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn slot(&self, id: &NodeId) -> Slot {
        Arc::clone(&self.slots.entry(id.clone()).or_default())
    }

    fn snapshot_slots(&self) -> Vec<Slot> {
        self.slots.iter().map(|r| Arc::clone(r.value())).collect()
    }

    /// Get the live connection for `node`, establishing one if needed.
    ///
    /// Fails fast with `ConnectionError::PoolDisabled` when the pool is
    /// disabled; the operation helpers fall back to single-use connections.
    pub async fn acquire(&self, node: &Node) -> Result<Arc<PooledConnection>, ConnectionError> {
        if !self.config.enabled {
            return Err(ConnectionError::PoolDisabled);
        }

        let slot = self.slot(&node.id);
        let mut guard = slot.lock().await;

        if let Some(conn) = guard.as_ref() {
            if conn.is_healthy() {
                conn.mark_used();
                return Ok(Arc::clone(conn));
            }
        }
        if let Some(stale) = guard.take() {
            tracing::debug!("Discarding closed connection to {}", node.id);
            stale.shell.close().await;
        }

        let shell = self.establish(node).await?;
        let conn = Arc::new(PooledConnection::new(node.id.clone(), shell));
        conn.mark_used();
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    /// Connect to `node`, retrying with exponential backoff
    async fn establish(&self, node: &Node) -> Result<Arc<dyn RemoteShell>, ConnectionError> {
        let attempts = self.config.max_retries.max(1);
        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = tokio::time::timeout(
                self.config.connect_timeout,
                self.connector.connect(node),
            )
            .await
            .unwrap_or(Err(ConnectionError::Timeout(self.config.connect_timeout)));

            match result {
                Ok(shell) => {
                    tracing::info!("Connected to {} (attempt {})", node.id, attempt);
                    return Ok(shell);
                }
                Err(e) if !e.is_retryable() => {
                    tracing::warn!("Connection to {} failed permanently: {}", node.id, e);
                    return Err(e);
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            "Connection to {} failed (attempt {}/{}): {}. Retrying in {:?}",
                            node.id,
                            attempt,
                            attempts,
                            e,
                            delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::error!(
            "Giving up on {} after {} attempts: {}",
            node.id,
            attempts,
            last_error
        );
        Err(ConnectionError::RetriesExhausted {
            attempts,
            last: last_error,
        })
    }

    /// Run `op` against a shell for `node` under `timeout`.
    ///
    /// A failed or abandoned operation evicts the connection it ran on.
    async fn run<T, F, Fut>(
        &self,
        node: &Node,
        timeout: Duration,
        what: &str,
        op: F,
    ) -> Result<T, ConnectionError>
    where
        F: FnOnce(Arc<dyn RemoteShell>) -> Fut,
        Fut: Future<Output = Result<T, ConnectionError>>,
    {
        if !self.config.enabled {
            let shell = self.establish(node).await?;
            let result = with_deadline(timeout, op(Arc::clone(&shell))).await;
            shell.close().await;
            return result;
        }

        let conn = self.acquire(node).await?;
        match with_deadline(timeout, op(conn.shell())).await {
            Ok(value) => {
                conn.touch();
                Ok(value)
            }
            Err(e) => {
                self.evict_connection(&conn, &format!("{} failed: {}", what, e))
                    .await;
                Err(e)
            }
        }
    }

    /// Run a command on `node`.
    ///
    /// A non-zero exit status is returned as output, not as an error; only
    /// transport failures and deadline expiry produce `Err`.
    pub async fn exec(
        &self,
        node: &Node,
        command: &str,
        timeout: Duration,
    ) -> Result<ExecOutput, ConnectionError> {
        self.run(node, timeout, "exec", |shell| async move {
            shell.exec(command).await
        })
        .await
    }

    /// Replace a file on `node`
    pub async fn write_file(
        &self,
        node: &Node,
        path: &str,
        content: &[u8],
    ) -> Result<(), ConnectionError> {
        self.run(node, self.config.command_timeout, "write", |shell| async move {
            shell.write_file(path, content).await
        })
        .await
    }

    /// Read a file from `node`; `None` if it does not exist
    pub async fn read_file(
        &self,
        node: &Node,
        path: &str,
    ) -> Result<Option<Vec<u8>>, ConnectionError> {
        self.run(node, self.config.command_timeout, "read", |shell| async move {
            shell.read_file(path).await
        })
        .await
    }

    /// Evict `conn` if it is still the pooled connection for its node
    async fn evict_connection(&self, conn: &Arc<PooledConnection>, reason: &str) {
        let slot = match self.slots.get(conn.node_id()) {
            Some(slot) => Arc::clone(&slot),
            None => return,
        };
        let removed = {
            let mut guard = slot.lock().await;
            match guard.as_ref() {
                Some(current) if Arc::ptr_eq(current, conn) => guard.take(),
                _ => None,
            }
        };
        if let Some(conn) = removed {
            tracing::warn!("Evicting connection to {}: {}", conn.node_id, reason);
            conn.shell.close().await;
        }
    }

    /// Remove and close the connection for `node_id`.
    ///
    /// Returns whether a connection was removed.
    pub async fn evict(&self, node_id: &NodeId, reason: &str) -> bool {
        let slot = match self.slots.get(node_id) {
            Some(slot) => Arc::clone(&slot),
            None => return false,
        };
        let removed = slot.lock().await.take();
        match removed {
            Some(conn) => {
                tracing::info!("Evicting connection to {}: {}", node_id, reason);
                conn.shell.close().await;
                true
            }
            None => false,
        }
    }

    /// Evict every connection unused for longer than the idle timeout.
    ///
    /// Slots busy establishing a connection are skipped. Returns the number
    /// of evicted connections.
    pub async fn sweep_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut evicted = Vec::new();

        for slot in self.snapshot_slots() {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            let expired = guard
                .as_ref()
                .map(|conn| conn.idle_for() > idle_timeout)
                .unwrap_or(false);
            if expired {
                if let Some(conn) = guard.take() {
                    evicted.push(conn);
                }
            }
        }

        for conn in &evicted {
            tracing::info!(
                "Evicting idle connection to {} (idle {:?})",
                conn.node_id,
                conn.idle_for()
            );
            conn.shell.close().await;
        }
        evicted.len()
    }

    /// Probe every live connection.
    ///
    /// A connection is evicted once it has failed `keepalive_count_max`
    /// consecutive probes, or immediately if its transport has closed.
    /// Probing does not count as use for idle accounting.
    pub async fn keepalive(&self) -> usize {
        let max_failures = self.config.keepalive_count_max.max(1);
        let live: Vec<Arc<PooledConnection>> = self
            .snapshot_slots()
            .iter()
            .filter_map(peek)
            .collect();

        let mut evicted = 0;
        for conn in live {
            if !conn.is_healthy() {
                self.evict_connection(&conn, "transport closed").await;
                evicted += 1;
                continue;
            }

            let probe = with_deadline(self.config.connect_timeout, conn.shell.probe()).await;
            match probe {
                Ok(()) => conn.keepalive_failures.store(0, Ordering::Relaxed),
                Err(e) => {
                    let failures = conn.keepalive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::debug!(
                        "Keepalive to {} failed ({}/{}): {}",
                        conn.node_id,
                        failures,
                        max_failures,
                        e
                    );
                    if failures >= max_failures {
                        self.evict_connection(
                            &conn,
                            &format!("{} consecutive keepalive failures", failures),
                        )
                        .await;
                        evicted += 1;
                    }
                }
            }
        }
        evicted
    }

    /// Close every pooled connection
    pub async fn shutdown(&self) -> usize {
        let mut closed = 0;
        for slot in self.snapshot_slots() {
            let conn = slot.lock().await.take();
            if let Some(conn) = conn {
                conn.shell.close().await;
                closed += 1;
            }
        }
        self.slots.clear();
        tracing::info!("Connection pool closed {} connections", closed);
        closed
    }

    /// Whether a live connection to `node_id` is pooled
    pub async fn contains(&self, node_id: &NodeId) -> bool {
        let slot = match self.slots.get(node_id) {
            Some(slot) => Arc::clone(&slot),
            None => return false,
        };
        let present = slot.lock().await.is_some();
        present
    }

    /// Number of pooled connections
    pub async fn len(&self) -> usize {
        let mut count = 0;
        for slot in self.snapshot_slots() {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Check if pool is empty
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Statistics for connections not currently being established
    pub fn stats(&self) -> Vec<ConnectionStats> {
        let mut stats: Vec<ConnectionStats> = self
            .snapshot_slots()
            .iter()
            .filter_map(peek)
            .map(|conn| ConnectionStats {
                node_id: conn.node_id.clone(),
                age: conn.created_at.elapsed(),
                idle: conn.idle_for(),
                use_count: conn.use_count(),
            })
            .collect();
        stats.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        stats
    }
}

/// Current connection in `slot`, unless the slot is busy
fn peek(slot: &Slot) -> Option<Arc<PooledConnection>> {
    slot.try_lock().ok().and_then(|guard| guard.clone())
}

async fn with_deadline<T, Fut>(timeout: Duration, fut: Fut) -> Result<T, ConnectionError>
where
    Fut: Future<Output = Result<T, ConnectionError>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .unwrap_or(Err(ConnectionError::Timeout(timeout)))
}
