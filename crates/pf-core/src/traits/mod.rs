//! Core trait definitions

mod store;
mod transport;

pub use store::{NodeStore, SnapshotStore, SyncRecord};
pub use transport::{Connector, RemoteShell};
