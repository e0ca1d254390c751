//! pf-orchestrator: Control plane and telemetry for a proxy fleet
//!
//! The orchestrator pushes configuration to nodes over pooled SSH
//! connections, verifies the proxy service came up, polls each node's stats
//! endpoint for traffic and online sessions, and rolls the results into
//! fine, hourly and daily snapshot series.

pub mod batch;
pub mod scheduler;
pub mod state;
pub mod sync;
pub mod telemetry;

pub use batch::{run_batched, BatchReport};
pub use state::FleetState;
pub use sync::SyncOrchestrator;
pub use telemetry::{SnapshotService, TelemetryCollector};
