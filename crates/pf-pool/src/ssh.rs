//! SSH transport built on russh
//!
//! Each node gets one authenticated SSH connection. Commands and file
//! transfers run on their own session channels multiplexed over it, so a
//! file copy never interferes with a command in flight.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Config, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;

use pf_core::error::ConnectionError;
use pf_core::traits::{Connector, RemoteShell};
use pf_core::types::{Credentials, ExecOutput, Node, NodeId};

/// Exit code the read helper uses to report a missing file
const MISSING_FILE_EXIT: u32 = 44;

/// Quote a string for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Opens authenticated SSH sessions to nodes
pub struct SshConnector {
    config: Arc<Config>,
}

impl SshConnector {
    /// Create a connector with russh defaults.
    ///
    /// Liveness is handled by the pool's keepalive probes, so russh's own
    /// inactivity timeout is disabled.
    pub fn new() -> Self {
        let config = Config {
            inactivity_timeout: None,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, node: &Node) -> Result<Arc<dyn RemoteShell>, ConnectionError> {
        let target = &node.ssh;
        let address = target.address();
        let handler = ClientHandler {
            node_id: node.id.clone(),
        };

        tracing::debug!("Connecting to {} ({})", node.id, address);
        let mut handle = client::connect(Arc::clone(&self.config), address.as_str(), handler)
            .await
            .map_err(|e| ConnectionError::ConnectionRefused(format!("{}: {}", address, e)))?;

        tracing::debug!("Authenticating to {} as '{}'", node.id, target.username);
        let authenticated = match &target.credentials {
            Credentials::Password { password } => {
                handle
                    .authenticate_password(target.username.as_str(), password.as_str())
                    .await
            }
            Credentials::PrivateKey { pem, passphrase } => {
                let key = russh_keys::decode_secret_key(pem, passphrase.as_deref())
                    .map_err(|e| ConnectionError::InvalidKey(e.to_string()))?;
                handle
                    .authenticate_publickey(target.username.as_str(), Arc::new(key))
                    .await
            }
        }
        .map_err(|e| ConnectionError::ConnectionLost(format!("authentication error: {}", e)))?;

        if !authenticated {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "{}@{}",
                target.username, address
            )));
        }

        Ok(Arc::new(SshShell { handle }))
    }
}

/// One authenticated SSH connection
struct SshShell {
    handle: Handle<ClientHandler>,
}

/// Raw result of a channel exec
struct RawOutput {
    exit_code: u32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

fn channel_error(e: russh::Error) -> ConnectionError {
    ConnectionError::Channel(e.to_string())
}

impl SshShell {
    /// Run `command` on a fresh session channel, optionally feeding stdin
    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<RawOutput, ConnectionError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(channel_error)?;
        channel.exec(true, command).await.map_err(channel_error)?;

        if let Some(input) = stdin {
            channel.data(input).await.map_err(channel_error)?;
            channel.eof().await.map_err(channel_error)?;
        }

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                // ext 1 is SSH_EXTENDED_DATA_STDERR
                ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                    stderr.extend_from_slice(data)
                }
                ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        let exit_code = exit_code.ok_or_else(|| {
            ConnectionError::ConnectionLost(format!("no exit status for `{}`", command))
        })?;

        Ok(RawOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn exec(&self, command: &str) -> Result<ExecOutput, ConnectionError> {
        let raw = self.run(command, None).await?;
        Ok(ExecOutput {
            exit_code: raw.exit_code,
            stdout: String::from_utf8_lossy(&raw.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&raw.stderr).into_owned(),
        })
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), ConnectionError> {
        let quoted = shell_quote(path);
        let command = format!("mkdir -p \"$(dirname {q})\" && cat > {q}", q = quoted);
        let raw = self.run(&command, Some(content)).await?;
        if raw.exit_code != 0 {
            return Err(ConnectionError::Channel(format!(
                "writing {} failed: {}",
                path,
                String::from_utf8_lossy(&raw.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, ConnectionError> {
        let quoted = shell_quote(path);
        let command = format!(
            "if [ -f {q} ]; then cat {q}; else exit {code}; fi",
            q = quoted,
            code = MISSING_FILE_EXIT
        );
        let raw = self.run(&command, None).await?;
        match raw.exit_code {
            0 => Ok(Some(raw.stdout)),
            MISSING_FILE_EXIT => Ok(None),
            _ => Err(ConnectionError::Channel(format!(
                "reading {} failed: {}",
                path,
                String::from_utf8_lossy(&raw.stderr).trim()
            ))),
        }
    }

    async fn probe(&self) -> Result<(), ConnectionError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(channel_error)?;
        channel.close().await.map_err(channel_error)?;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "closing", "en")
            .await
        {
            tracing::debug!("Disconnect failed: {}", e);
        }
    }
}

/// SSH client handler for node connections
struct ClientHandler {
    node_id: NodeId,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    /// Accept the node's host key.
    ///
    /// Nodes are provisioned by the admin panel and reached by address only;
    /// no fingerprint is recorded to verify against.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        tracing::debug!(
            "Host key for {}: {}",
            self.node_id,
            server_public_key.fingerprint()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/hysteria/config.yaml"), "'/etc/hysteria/config.yaml'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
