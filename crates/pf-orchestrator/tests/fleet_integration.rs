//! Fleet integration tests
//!
//! Drives the wired-up fleet state end to end: mock SSH hosts behind the
//! connection pool, real HTTP stats endpoints served by wiremock, and the
//! in-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pf_core::config::FleetConfig;
use pf_core::error::TelemetryError;
use pf_core::stats::SeriesKind;
use pf_core::store::MemoryStore;
use pf_core::traits::NodeStore;
use pf_core::types::{Node, NodeId, NodeStatus, OnlineSession, TrafficCounters, TrafficDelta};
use pf_orchestrator::telemetry::{HttpStatsClient, StatsEndpoint};
use pf_orchestrator::FleetState;
use pf_pool::mock::{test_node, MockConnector};

const CONFIG_PATH: &str = "/etc/hysteria/config.yaml";

/// Build fleet state around a mock connector and the given endpoint
fn fleet(
    config: FleetConfig,
    nodes: Vec<Node>,
    endpoint: Arc<dyn StatsEndpoint>,
) -> (Arc<FleetState>, Arc<MockConnector>, Arc<MemoryStore>) {
    let connector = Arc::new(MockConnector::new());
    let store = Arc::new(MemoryStore::with_nodes(nodes));
    let state = FleetState::with_parts(
        config,
        connector.clone(),
        endpoint,
        store.clone(),
        store.clone(),
    );
    (Arc::new(state), connector, store)
}

fn http_endpoint() -> Arc<dyn StatsEndpoint> {
    Arc::new(HttpStatsClient::new(Duration::from_secs(2)).expect("client"))
}

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
}

#[tokio::test]
async fn test_concurrent_cold_acquires_share_one_connection() {
    let (state, connector, _) = fleet(FleetConfig::default(), vec![], http_endpoint());
    let node = test_node("n1");
    let pool = state.connection_pool();

    let mut handles = Vec::new();
    for i in 0..10 {
        let pool = Arc::clone(pool);
        let node = node.clone();
        handles.push(tokio::spawn(async move {
            pool.exec(&node, &format!("echo {}", i), Duration::from_secs(5))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(connector.connect_count(), 1);
    assert_eq!(pool.len().await, 1);
    assert_eq!(connector.host("n1").commands().len(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_is_evicted_and_reestablished() {
    let mut config = FleetConfig::default();
    config.pool.idle_timeout = Duration::from_secs(60);
    let (state, connector, _) = fleet(config, vec![], http_endpoint());
    let node = test_node("n1");
    let pool = state.connection_pool();

    pool.exec(&node, "uptime", Duration::from_secs(5)).await.unwrap();
    tokio::time::advance(Duration::from_secs(61)).await;

    assert_eq!(pool.sweep_idle().await, 1);
    assert!(!pool.contains(&node.id).await);
    assert_eq!(connector.open_shells(), 0);

    pool.exec(&node, "uptime", Duration::from_secs(5)).await.unwrap();
    assert_eq!(connector.connect_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_config_restores_exact_bytes() {
    let node = test_node("n1");
    let (state, connector, store) =
        fleet(FleetConfig::default(), vec![node.clone()], http_endpoint());
    let host = connector.host("n1");
    let original: Vec<u8> = (0u8..=255).collect();
    host.put_file(CONFIG_PATH, &original);
    host.respond("hysteria check", 1, "", "unknown field `obfs`");

    let outcome = state.orchestrator.sync_node(&node).await;

    assert!(!outcome.success);
    assert_eq!(outcome.status, NodeStatus::Error);
    assert_eq!(host.file(CONFIG_PATH).unwrap(), original);
    assert_eq!(host.file(&format!("{}.bak", CONFIG_PATH)).unwrap(), original);

    let stored = store.get_node(&node.id).await.unwrap();
    assert_eq!(stored.status, NodeStatus::Error);
    assert!(stored.last_error.unwrap().contains("unknown field"));
}

#[tokio::test(start_paused = true)]
async fn test_fleet_sync_mixed_results() {
    let nodes: Vec<Node> = (1..=7).map(|i| test_node(&format!("n{}", i))).collect();
    let mut config = FleetConfig::default();
    config.sync.batch_size = 3;
    let (state, connector, store) = fleet(config, nodes.clone(), http_endpoint());
    for node in &nodes {
        connector
            .host(node.id.as_str())
            .respond_ok("systemctl is-active", "active");
    }
    connector.host("n4").respond("systemctl is-active", 3, "failed", "");

    let outcomes = state
        .orchestrator
        .sync_all(nodes, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 7);
    assert_eq!(outcomes.iter().filter(|o| o.success).count(), 6);
    let n4 = store.get_node(&NodeId::new("n4")).await.unwrap();
    assert_eq!(n4.status, NodeStatus::Error);
    let n5 = store.get_node(&NodeId::new("n5")).await.unwrap();
    assert_eq!(n5.status, NodeStatus::Online);
}

/// Endpoint recording how many polls run at once
#[derive(Default)]
struct GaugedEndpoint {
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl StatsEndpoint for GaugedEndpoint {
    async fn fetch_traffic(
        &self,
        _node: &Node,
        _clear: bool,
    ) -> Result<HashMap<String, TrafficDelta>, TelemetryError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(HashMap::new())
    }

    async fn fetch_sessions(&self, _node: &Node) -> Result<Vec<OnlineSession>, TelemetryError> {
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn test_poll_concurrency_bounded_by_batch_size() {
    let nodes: Vec<Node> = (0..23).map(|i| test_node(&format!("n{:02}", i))).collect();
    let endpoint = Arc::new(GaugedEndpoint::default());
    let (state, _, _) = fleet(FleetConfig::default(), nodes.clone(), endpoint.clone());

    let reports = state
        .collector
        .poll_all(nodes, &CancellationToken::new())
        .await;

    assert_eq!(reports.len(), 23);
    let peak = endpoint.peak.load(Ordering::SeqCst);
    assert!(peak <= 5, "peak concurrency {}", peak);
    assert!(peak >= 2);
}

#[tokio::test]
async fn test_poll_over_http_updates_counters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/traffic"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "alice": {"tx": 1000, "rx": 4000},
            "bob": {"tx": 24, "rx": 0}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/online"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"user": "alice", "addr": "203.0.113.9:40001"}
        ])))
        .mount(&server)
        .await;

    let mut node = test_node("n1");
    node.stats_url = server.uri();
    let (state, _, store) = fleet(FleetConfig::default(), vec![node.clone()], http_endpoint());

    state.collector.poll_node(&node).await;
    state.collector.poll_node(&node).await;

    let stored = store.get_node(&node.id).await.unwrap();
    assert_eq!(stored.traffic, TrafficCounters::new(2048, 8000));
    assert_eq!(stored.online_count, 1);
    assert_eq!(store.user_traffic("bob"), Some(TrafficCounters::new(48, 0)));
}

#[tokio::test]
async fn test_unreachable_stats_leave_status_alone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut node = test_node("n1");
    node.stats_url = server.uri();
    node.status = NodeStatus::Online;
    let (state, _, store) = fleet(FleetConfig::default(), vec![node.clone()], http_endpoint());

    let report = state.collector.poll_node(&node).await;

    assert!(!report.is_ok());
    let stored = store.get_node(&node.id).await.unwrap();
    assert_eq!(stored.status, NodeStatus::Online);
    assert!(stored.last_error.unwrap().contains("503"));
}

#[tokio::test]
async fn test_hourly_rollup_from_fine_snapshots() {
    let node = test_node("n1");
    let (state, _, store) = fleet(FleetConfig::default(), vec![node.clone()], http_endpoint());

    // seeds the reconciler baseline in the previous hour
    let seed = state.snapshots.save_fine(at(8, 55)).await.unwrap();
    assert_eq!((seed.tx, seed.rx), (0, 0));

    let mut expected_tx = 0;
    for i in 1..=12u64 {
        let sessions = (0..i)
            .map(|u| OnlineSession {
                user: format!("user{}", u),
                addr: None,
            })
            .collect();
        store.set_sessions(&node.id, sessions).await.unwrap();
        store
            .apply_traffic(&node.id, TrafficCounters::new(100 * i, 10 * i), &HashMap::new())
            .await
            .unwrap();
        expected_tx += 100 * i;

        let minute = ((i - 1) * 5) as u32;
        let fine = state.snapshots.save_fine(at(9, minute)).await.unwrap();
        assert_eq!(fine.online, i);
        assert_eq!(fine.tx, 100 * i);
    }

    let hourly = state.snapshots.save_hourly(at(10, 0)).await.unwrap();

    assert_eq!(hourly.timestamp, at(9, 0));
    assert_eq!(hourly.online, 7);
    assert_eq!(hourly.tx, expected_tx);
    assert_eq!(hourly.rx, expected_tx / 10);
    assert_eq!(hourly.active_users, 12);

    // rerunning the rollup for the same hour replaces it
    state.snapshots.save_hourly(at(10, 40)).await.unwrap();
    assert_eq!(store.snapshot_count(SeriesKind::Hourly).await, 1);

    let series = state
        .snapshots
        .series(SeriesKind::Fine, at(9, 0), at(10, 0))
        .await
        .unwrap();
    assert_eq!(series.len(), 12);
    assert!(series.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
}

#[tokio::test]
async fn test_fine_snapshot_upsert_keeps_latest_values() {
    let node = test_node("n1");
    let (state, _, store) = fleet(FleetConfig::default(), vec![node.clone()], http_endpoint());

    state.snapshots.save_fine(at(12, 0)).await.unwrap();
    store
        .set_sessions(
            &node.id,
            vec![OnlineSession {
                user: "alice".into(),
                addr: None,
            }],
        )
        .await
        .unwrap();
    state.snapshots.save_fine(at(12, 3)).await.unwrap();

    assert_eq!(store.snapshot_count(SeriesKind::Fine).await, 1);
    let summary = state.snapshots.summary().await.unwrap();
    assert_eq!(summary.latest.unwrap().online, 1);
}
