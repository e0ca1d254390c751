//! Core domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a managed node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a new node ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a node.
///
/// Only the sync orchestrator moves a node between these states;
/// telemetry records soft errors in `last_error` and leaves this alone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Never synced, or taken out of service
    #[default]
    Offline,
    /// A configuration push is in progress
    Syncing,
    /// Service confirmed running after the last push
    Online,
    /// Last push failed validation, activation or transport
    Error,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Offline => write!(f, "offline"),
            NodeStatus::Syncing => write!(f, "syncing"),
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Error => write!(f, "error"),
        }
    }
}

/// Shell credentials, already decrypted by the caller
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credentials {
    /// Password authentication
    Password { password: String },
    /// Private key authentication (OpenSSH or PEM text)
    PrivateKey {
        pem: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password { .. } => write!(f, "Password(<redacted>)"),
            Credentials::PrivateKey { .. } => write!(f, "PrivateKey(<redacted>)"),
        }
    }
}

/// Where and how to open a remote shell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub username: String,
    pub credentials: Credentials,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

impl SshTarget {
    /// `host:port` form for connecting
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Certificate provisioning mode for the proxy listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TlsMode {
    /// Automatic certificates via ACME
    Acme {
        domains: Vec<String>,
        email: String,
    },
    /// Certificate files already present on the node
    Static { cert_path: String, key_path: String },
}

/// Inclusive UDP port range used for port hopping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    /// iptables `--dport` notation
    pub fn to_dport(&self) -> String {
        format!("{}:{}", self.start, self.end)
    }

    pub fn is_valid(&self) -> bool {
        self.start > 0 && self.start <= self.end
    }
}

/// Bandwidth limits advertised by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bandwidth {
    pub up: String,
    pub down: String,
}

/// Configuration parameters for a node, supplied by the admin panel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub listen_port: u16,
    pub tls: TlsMode,
    /// HTTP endpoint the proxy calls to authenticate end users
    pub auth_callback_url: String,
    /// Bind address of the proxy's traffic stats API
    pub stats_listen: String,
    pub stats_secret: String,
    #[serde(default)]
    pub custom_config: Option<String>,
    #[serde(default)]
    pub use_custom_config: bool,
    #[serde(default)]
    pub port_hopping: Option<PortRange>,
    #[serde(default)]
    pub masquerade_url: Option<String>,
    #[serde(default)]
    pub bandwidth: Option<Bandwidth>,
}

/// Cumulative traffic counters in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub tx: u64,
    pub rx: u64,
}

impl TrafficCounters {
    pub fn new(tx: u64, rx: u64) -> Self {
        Self { tx, rx }
    }

    pub fn is_zero(&self) -> bool {
        self.tx == 0 && self.rx == 0
    }
}

impl std::ops::AddAssign for TrafficCounters {
    fn add_assign(&mut self, other: Self) {
        self.tx = self.tx.saturating_add(other.tx);
        self.rx = self.rx.saturating_add(other.rx);
    }
}

/// A node's counters at one poll instant
pub type TrafficSample = TrafficCounters;

/// Traffic accrued between two samples
pub type TrafficDelta = TrafficCounters;

/// One connected end-user session as reported by the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineSession {
    pub user: String,
    #[serde(default)]
    pub addr: Option<String>,
}

/// Snapshot of a managed node handed in per operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub ssh: SshTarget,
    pub settings: NodeSettings,
    /// Base URL of the stats endpoint, e.g. `http://10.0.0.5:9999`
    pub stats_url: String,
    pub stats_secret: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    #[serde(default)]
    pub traffic: TrafficCounters,
    #[serde(default)]
    pub online_count: u64,
    #[serde(default)]
    pub sessions: Vec<OnlineSession>,
}

fn default_active() -> bool {
    true
}

impl Node {
    /// Display label used in logs and breakdowns
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            self.id.as_str()
        } else {
            &self.name
        }
    }
}

/// Result of running a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: u32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stderr if present, otherwise stdout, trimmed
    pub fn diagnostic(&self) -> &str {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim()
        } else {
            err
        }
    }
}

/// Result of one node's sync attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub node_id: NodeId,
    pub success: bool,
    pub status: NodeStatus,
    pub log: Vec<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub used_custom_config: bool,
}

impl SyncOutcome {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            success: false,
            status: NodeStatus::Syncing,
            log: Vec::new(),
            error: None,
            used_custom_config: false,
        }
    }

    /// Append a log line, mirroring it to tracing
    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        tracing::debug!("[{}] {}", self.node_id, line);
        self.log.push(line);
    }

    pub fn succeed(mut self, status: NodeStatus) -> Self {
        self.success = true;
        self.status = status;
        self.error = None;
        self
    }

    pub fn fail(mut self, status: NodeStatus, error: impl Into<String>) -> Self {
        let error = error.into();
        self.log.push(format!("failed: {}", error));
        self.success = false;
        self.status = status;
        self.error = Some(error);
        self
    }
}
