//! Traffic telemetry and snapshot rollups

pub mod client;
pub mod collector;
pub mod reconcile;
pub mod snapshot;

pub use client::{HttpStatsClient, StatsEndpoint};
pub use collector::{PollReport, TelemetryCollector, TELEMETRY_NOTE_PREFIX};
pub use reconcile::TrafficReconciler;
pub use snapshot::SnapshotService;
