//! pf-core: Core abstractions and configuration for proxy-fleet
//!
//! This crate provides the node model, error taxonomy, configuration
//! structures and storage traits shared by the connection pool and the
//! orchestrator.

pub mod config;
pub mod error;
pub mod stats;
pub mod store;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{ConnectionError, PfError, StoreError, SyncError, TelemetryError};
pub use stats::{SeriesKind, StatsSnapshot};
pub use types::{Node, NodeId, NodeStatus};
