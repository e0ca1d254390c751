//! Stats endpoint client
//!
//! Each proxy exposes a small HTTP API next to its listener. Requests are
//! authenticated with the node's stats secret sent verbatim in the
//! `Authorization` header.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

use pf_core::error::TelemetryError;
use pf_core::types::{Node, OnlineSession, TrafficDelta};

/// Source of per-node traffic counters and online sessions
#[async_trait]
pub trait StatsEndpoint: Send + Sync {
    /// Per-user traffic since the previous clearing read.
    ///
    /// With `clear` set the node resets its counters after answering, so
    /// every byte is reported exactly once.
    async fn fetch_traffic(
        &self,
        node: &Node,
        clear: bool,
    ) -> Result<HashMap<String, TrafficDelta>, TelemetryError>;

    /// Sessions currently connected to the node
    async fn fetch_sessions(&self, node: &Node) -> Result<Vec<OnlineSession>, TelemetryError>;
}

/// `StatsEndpoint` over HTTP
#[derive(Debug, Clone)]
pub struct HttpStatsClient {
    http_client: Client,
}

impl HttpStatsClient {
    /// Create a client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Result<Self, TelemetryError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TelemetryError::Unreachable(e.to_string()))?;
        Ok(Self { http_client })
    }

    async fn get<T: DeserializeOwned>(&self, node: &Node, path: &str) -> Result<T, TelemetryError> {
        let base = node.stats_url.trim_end_matches('/');
        let url = format!("{}/{}", base, path.trim_start_matches('/'));

        let response = self
            .http_client
            .get(&url)
            .header("Authorization", node.stats_secret.as_str())
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TelemetryError::Status(status.as_u16()));
        }

        response.json::<T>().await.map_err(|e| {
            if e.is_timeout() {
                TelemetryError::Timeout
            } else {
                TelemetryError::Malformed(e.to_string())
            }
        })
    }
}

fn map_transport_error(e: reqwest::Error) -> TelemetryError {
    if e.is_timeout() {
        TelemetryError::Timeout
    } else {
        TelemetryError::Unreachable(e.to_string())
    }
}

#[async_trait]
impl StatsEndpoint for HttpStatsClient {
    async fn fetch_traffic(
        &self,
        node: &Node,
        clear: bool,
    ) -> Result<HashMap<String, TrafficDelta>, TelemetryError> {
        let path = if clear { "traffic?clear=1" } else { "traffic" };
        self.get(node, path).await
    }

    async fn fetch_sessions(&self, node: &Node) -> Result<Vec<OnlineSession>, TelemetryError> {
        self.get(node, "online").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pf_core::types::TrafficCounters;
    use pf_pool::mock::test_node;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn node_at(server: &MockServer) -> Node {
        let mut node = test_node("n1");
        node.stats_url = format!("{}/", server.uri());
        node
    }

    fn client() -> HttpStatsClient {
        HttpStatsClient::new(Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_traffic_clears_and_authenticates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/traffic"))
            .and(query_param("clear", "1"))
            .and(header("Authorization", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "alice": {"tx": 100, "rx": 2048},
                "bob": {"tx": 5, "rx": 0}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let traffic = client().fetch_traffic(&node_at(&server), true).await.unwrap();

        assert_eq!(traffic.len(), 2);
        assert_eq!(traffic["alice"], TrafficCounters::new(100, 2048));
        assert_eq!(traffic["bob"], TrafficCounters::new(5, 0));
    }

    #[tokio::test]
    async fn test_fetch_sessions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/online"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"user": "alice", "addr": "203.0.113.7:51000"},
                {"user": "alice", "addr": "198.51.100.2:40000"},
                {"user": "bob"}
            ])))
            .mount(&server)
            .await;

        let sessions = client().fetch_sessions(&node_at(&server)).await.unwrap();

        assert_eq!(sessions.len(), 3);
        assert_eq!(sessions[0].addr.as_deref(), Some("203.0.113.7:51000"));
        assert_eq!(sessions[2].user, "bob");
        assert!(sessions[2].addr.is_none());
    }

    #[tokio::test]
    async fn test_wrong_secret_maps_to_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = client().fetch_sessions(&node_at(&server)).await.unwrap_err();
        assert!(matches!(err, TelemetryError::Status(401)));
    }

    #[tokio::test]
    async fn test_bad_json_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/traffic"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = client()
            .fetch_traffic(&node_at(&server), false)
            .await
            .unwrap_err();
        assert!(matches!(err, TelemetryError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([]))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let client = HttpStatsClient::new(Duration::from_millis(200)).unwrap();
        let err = client.fetch_sessions(&node_at(&server)).await.unwrap_err();
        assert!(matches!(err, TelemetryError::Timeout));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let mut node = test_node("n1");
        node.stats_url = "http://127.0.0.1:1".into();

        let err = client().fetch_sessions(&node).await.unwrap_err();
        assert!(matches!(err, TelemetryError::Unreachable(_)));
    }
}
