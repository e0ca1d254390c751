//! Node profile configuration

use serde::{Deserialize, Serialize};

use crate::types::{Node, NodeId, NodeSettings, SshTarget};

/// Profile for a managed node as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProfile {
    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Remote shell target
    pub ssh: SshTarget,

    /// Proxy configuration parameters
    pub settings: NodeSettings,

    /// Base URL of the node's stats endpoint
    pub stats_url: String,

    /// Whether fleet operations include this node
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl NodeProfile {
    /// Build a fresh node snapshot with no runtime state
    pub fn to_node(&self, id: NodeId) -> Node {
        Node {
            id,
            name: self.name.clone(),
            ssh: self.ssh.clone(),
            stats_secret: self.settings.stats_secret.clone(),
            settings: self.settings.clone(),
            stats_url: self.stats_url.clone(),
            active: self.active,
            status: Default::default(),
            last_error: None,
            last_sync: None,
            traffic: Default::default(),
            online_count: 0,
            sessions: Vec::new(),
        }
    }
}
