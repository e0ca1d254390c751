//! Core error types for proxy-fleet

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the proxy-fleet ecosystem
#[derive(Error, Debug)]
pub enum PfError {
    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Telemetry error
    #[error("Telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),

    /// Storage error
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote shell transport errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Authentication failed
    #[error("Authentication failed for {0}")]
    AuthenticationFailed(String),

    /// Connection refused or handshake failed
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Connection lost while in use
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Operation exceeded its deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Pool is disabled by configuration
    #[error("Connection pool is disabled")]
    PoolDisabled,

    /// Every establishment attempt failed
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Host key verification failed
    #[error("Host key verification failed")]
    HostKeyVerificationFailed,

    /// Private key could not be decoded
    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    /// Channel-level failure (open, exec, transfer)
    #[error("Channel error: {0}")]
    Channel(String),
}

impl ConnectionError {
    /// Whether retrying the handshake can plausibly succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::AuthenticationFailed(_)
                | ConnectionError::HostKeyVerificationFailed
                | ConnectionError::InvalidKey(_)
                | ConnectionError::PoolDisabled
        )
    }
}

/// Control-plane errors raised while pushing configuration
#[derive(Error, Debug)]
pub enum SyncError {
    /// Remote service rejected the pushed configuration
    #[error("Configuration rejected: {0}")]
    Validation(String),

    /// Service did not reach running state after activation
    #[error("Service not running: {0}")]
    Service(String),

    /// Transport failure during sync
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// A fleet-wide sync is already in progress
    #[error("A fleet sync is already running")]
    AlreadyRunning,

    /// This node is already being synced
    #[error("Node {0} is already syncing")]
    NodeBusy(String),

    /// Status could not be persisted
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Stats endpoint errors. These never change node status.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Endpoint could not be reached
    #[error("Stats endpoint unreachable: {0}")]
    Unreachable(String),

    /// Request exceeded its deadline
    #[error("Stats request timed out")]
    Timeout,

    /// Endpoint answered with a non-success status
    #[error("Stats endpoint returned HTTP {0}")]
    Status(u16),

    /// Response body could not be decoded
    #[error("Malformed stats response: {0}")]
    Malformed(String),

    /// Counters could not be persisted
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistence errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Node is unknown to the store
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Backend failure
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failures_are_not_retryable() {
        assert!(!ConnectionError::AuthenticationFailed("root@host".into()).is_retryable());
        assert!(!ConnectionError::PoolDisabled.is_retryable());
        assert!(ConnectionError::ConnectionRefused("reset".into()).is_retryable());
        assert!(ConnectionError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_sync_error_wraps_connection_error() {
        let err: SyncError = ConnectionError::ConnectionLost("eof".into()).into();
        assert_eq!(err.to_string(), "Connection lost: eof");
    }
}
