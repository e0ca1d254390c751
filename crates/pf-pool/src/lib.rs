//! pf-pool: Remote shell connection pool for proxy-fleet
//!
//! Owns at most one live SSH session per node, creates sessions on demand
//! with retry and backoff, keeps them warm with keepalive probes, evicts idle
//! or broken ones, and exposes command execution and file transfer on top.

pub mod backoff;
pub mod maintenance;
pub mod pool;
pub mod ssh;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use backoff::ExponentialBackoff;
pub use maintenance::run_maintenance;
pub use pool::{ConnectionPool, ConnectionStats, PooledConnection};
pub use ssh::SshConnector;
