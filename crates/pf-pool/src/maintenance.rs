//! Background pool maintenance
//!
//! Periodically evicts idle connections and probes live ones so sessions
//! survive NAT and firewall idle timeouts between fleet operations.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::pool::ConnectionPool;

/// Run idle sweeps and keepalive probes until `cancel` fires.
///
/// On cancellation every pooled connection is closed before returning.
pub async fn run_maintenance(pool: Arc<ConnectionPool>, cancel: CancellationToken) {
    let sweep_interval = pool.config().sweep_interval;
    let keepalive_interval = pool.config().keepalive_interval;

    let mut sweep = tokio::time::interval(sweep_interval);
    let mut keepalive = tokio::time::interval(keepalive_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        "Starting pool maintenance (idle timeout: {:?}, sweep: {:?}, keepalive: {:?})",
        pool.config().idle_timeout,
        sweep_interval,
        keepalive_interval
    );

    loop {
        tokio::select! {
            _ = sweep.tick() => {
                let evicted = pool.sweep_idle().await;
                if evicted > 0 {
                    tracing::info!("Evicted {} idle connections", evicted);
                }
            }
            _ = keepalive.tick() => {
                let evicted = pool.keepalive().await;
                if evicted > 0 {
                    tracing::warn!("Evicted {} unresponsive connections", evicted);
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Pool maintenance shutting down");
                break;
            }
        }
    }

    pool.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pf_core::config::PoolConfig;
    use pf_core::traits::Connector;

    use crate::mock::{test_node, MockConnector};

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_evicts_idle_and_closes_on_cancel() {
        let connector = Arc::new(MockConnector::new());
        let config = PoolConfig {
            idle_timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(30),
            ..Default::default()
        };
        let pool = Arc::new(ConnectionPool::new(
            config,
            Arc::clone(&connector) as Arc<dyn Connector>,
        ));
        let node = test_node("n1");
        pool.acquire(&node).await.unwrap();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_maintenance(Arc::clone(&pool), cancel.clone()));

        tokio::time::sleep(Duration::from_secs(150)).await;
        assert!(!pool.contains(&node.id).await);

        pool.acquire(&node).await.unwrap();
        cancel.cancel();
        task.await.unwrap();

        assert!(pool.is_empty().await);
        assert_eq!(connector.open_shells(), 0);
    }
}
