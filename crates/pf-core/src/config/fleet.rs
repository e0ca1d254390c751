//! Fleet daemon configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use super::NodeProfile;
use crate::error::ConfigError;
use crate::types::{Node, NodeId};

/// Top-level configuration for the fleet daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Remote shell connection pool
    pub pool: PoolConfig,

    /// Configuration push behaviour
    pub sync: SyncConfig,

    /// Stats polling behaviour
    pub telemetry: TelemetryConfig,

    /// Managed nodes, keyed by node ID
    pub nodes: HashMap<String, NodeProfile>,
}

impl FleetConfig {
    /// Reject settings that would stall or spin the scheduler
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.batch_size == 0 || self.telemetry.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.telemetry.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("telemetry.poll_interval must be non-zero".into()));
        }
        if self.pool.sweep_interval.is_zero() || self.pool.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid("pool intervals must be non-zero".into()));
        }
        if !self.sync.validate_command.contains("{config}") {
            return Err(ConfigError::Invalid(
                "sync.validate_command must contain a {config} placeholder".into(),
            ));
        }
        for (id, profile) in &self.nodes {
            if let Some(range) = profile.settings.port_hopping {
                if !range.is_valid() {
                    return Err(ConfigError::Invalid(format!(
                        "node {}: invalid port hopping range {}",
                        id,
                        range.to_dport()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Materialize node snapshots from the configured profiles, sorted by ID
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .map(|(id, profile)| profile.to_node(NodeId::new(id.clone())))
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// When false, every operation opens a single-use connection
    pub enabled: bool,

    /// Maximum connection attempts before giving up
    pub max_retries: u32,

    /// Backoff between connection attempts
    pub backoff: BackoffConfig,

    /// Handshake + authentication deadline
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Default deadline for remote commands and file transfers
    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,

    /// Connections unused for longer than this are evicted
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// How often the idle sweep runs
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// How often live connections are probed
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Consecutive probe failures before eviction
    pub keepalive_count_max: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(30),
            keepalive_count_max: 3,
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_millis")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_millis")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

/// Configuration push settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Nodes synced concurrently per batch
    pub batch_size: usize,

    /// Path of the proxy configuration on the node
    pub remote_config_path: String,

    /// systemd unit running the proxy
    pub service_name: String,

    /// Command that checks a config file; `{config}` is replaced by its path
    pub validate_command: String,

    /// Wait between restart and the running-state check
    #[serde(with = "duration_secs")]
    pub settle_delay: Duration,

    /// Journal lines attached to a service failure
    pub log_tail_lines: u32,

    /// Sync every active node once when the daemon starts
    pub sync_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            remote_config_path: "/etc/hysteria/config.yaml".to_string(),
            service_name: "hysteria-server".to_string(),
            validate_command: "hysteria check -c {config}".to_string(),
            settle_delay: Duration::from_secs(3),
            log_tail_lines: 20,
            sync_on_start: false,
        }
    }
}

impl SyncConfig {
    /// Sibling path holding the previous configuration
    pub fn backup_path(&self) -> String {
        format!("{}.bak", self.remote_config_path)
    }
}

/// Stats polling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Nodes polled concurrently per batch
    pub batch_size: usize,

    /// Interval between fleet polls
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,

    /// Delay before the first poll after startup
    #[serde(with = "duration_secs")]
    pub warmup_delay: Duration,

    /// Deadline for each stats HTTP request
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            poll_interval: Duration::from_secs(300),
            warmup_delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
        }
    }
}
