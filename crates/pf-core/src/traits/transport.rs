//! Remote shell transport traits

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ConnectionError;
use crate::types::{ExecOutput, Node};

/// A live remote shell session to one node
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run a command and collect its exit code and output
    async fn exec(&self, command: &str) -> Result<ExecOutput, ConnectionError>;

    /// Replace the file at `path` with `content`
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), ConnectionError>;

    /// Read the file at `path`; `None` if it does not exist
    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, ConnectionError>;

    /// Cheap round trip proving the session is still usable
    async fn probe(&self) -> Result<(), ConnectionError>;

    /// Whether the underlying transport has already gone away
    fn is_closed(&self) -> bool;

    /// Close the session gracefully
    async fn close(&self);
}

/// Opens remote shell sessions to nodes
#[async_trait]
pub trait Connector: Send + Sync {
    /// Perform one connection attempt (handshake + authentication)
    async fn connect(&self, node: &Node) -> Result<Arc<dyn RemoteShell>, ConnectionError>;
}
