//! In-memory connector and shell for tests
//!
//! Each node ID maps to a `MockHost` holding a fake filesystem, scripted
//! command responses and counters. Shells opened by the connector operate on
//! their node's host, so state survives reconnects the way a real remote
//! filesystem does.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use pf_core::error::ConnectionError;
use pf_core::traits::{Connector, RemoteShell};
use pf_core::types::{
    Credentials, ExecOutput, Node, NodeId, NodeSettings, SshTarget, TlsMode,
};

/// Build a node with placeholder settings
pub fn test_node(id: &str) -> Node {
    Node {
        id: NodeId::new(id),
        name: format!("node {}", id),
        ssh: SshTarget {
            host: format!("{}.test", id),
            port: 22,
            username: "root".to_string(),
            credentials: Credentials::Password {
                password: "pw".to_string(),
            },
        },
        settings: NodeSettings {
            listen_port: 443,
            tls: TlsMode::Acme {
                domains: vec![format!("{}.example.com", id)],
                email: "ops@example.com".to_string(),
            },
            auth_callback_url: "https://panel.example.com/api/auth".to_string(),
            stats_listen: ":9999".to_string(),
            stats_secret: "secret".to_string(),
            custom_config: None,
            use_custom_config: false,
            port_hopping: None,
            masquerade_url: None,
            bandwidth: None,
        },
        stats_url: format!("http://{}.test:9999", id),
        stats_secret: "secret".to_string(),
        active: true,
        status: Default::default(),
        last_error: None,
        last_sync: None,
        traffic: Default::default(),
        online_count: 0,
        sessions: Vec::new(),
    }
}

#[derive(Clone)]
enum Response {
    Output(ExecOutput),
    TransportError,
    Hang,
}

/// Fake remote host state shared by every shell opened to one node
#[derive(Default)]
pub struct MockHost {
    files: Mutex<HashMap<String, Vec<u8>>>,
    rules: Mutex<Vec<(String, Response)>>,
    torn_writes: Mutex<Vec<String>>,
    commands: Mutex<Vec<String>>,
    fail_probes: AtomicBool,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockHost {
    fn add_rule(&self, pattern: &str, response: Response) {
        // newest rule wins
        self.rules
            .lock()
            .unwrap()
            .insert(0, (pattern.to_string(), response));
    }

    /// Commands containing `pattern` succeed with `stdout`
    pub fn respond_ok(&self, pattern: &str, stdout: &str) {
        self.respond(pattern, 0, stdout, "");
    }

    /// Commands containing `pattern` produce the given output
    pub fn respond(&self, pattern: &str, exit_code: u32, stdout: &str, stderr: &str) {
        self.add_rule(
            pattern,
            Response::Output(ExecOutput {
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            }),
        );
    }

    /// Commands containing `pattern` fail at the transport level
    pub fn fail_commands_matching(&self, pattern: &str) {
        self.add_rule(pattern, Response::TransportError);
    }

    /// Commands containing `pattern` never complete
    pub fn hang_commands_matching(&self, pattern: &str) {
        self.add_rule(pattern, Response::Hang);
    }

    /// The next write to `path` stores half the content, then drops the link
    pub fn tear_next_write(&self, path: &str) {
        self.torn_writes.lock().unwrap().push(path.to_string());
    }

    fn take_torn_write(&self, path: &str) -> bool {
        let mut torn = self.torn_writes.lock().unwrap();
        match torn.iter().position(|p| p == path) {
            Some(i) => {
                torn.remove(i);
                true
            }
            None => false,
        }
    }

    /// Make keepalive probes fail or succeed
    pub fn fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// Seed a file
    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
    }

    /// Current content of a file
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Every command executed so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Highest number of commands observed running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn response_for(&self, command: &str) -> Response {
        self.rules
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or(Response::Output(ExecOutput::default()))
    }
}

/// Shell operating on a `MockHost`
pub struct MockShell {
    host: Arc<MockHost>,
    closed: AtomicBool,
    exec_delay: Duration,
}

impl MockShell {
    fn check_open(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionLost("shell closed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteShell for MockShell {
    async fn exec(&self, command: &str) -> Result<ExecOutput, ConnectionError> {
        self.check_open()?;
        self.host.commands.lock().unwrap().push(command.to_string());

        let now = self.host.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.host.max_active.fetch_max(now, Ordering::SeqCst);
        if !self.exec_delay.is_zero() {
            tokio::time::sleep(self.exec_delay).await;
        }
        let response = self.host.response_for(command);
        self.host.active.fetch_sub(1, Ordering::SeqCst);

        match response {
            Response::Output(out) => Ok(out),
            Response::TransportError => {
                Err(ConnectionError::ConnectionLost(format!("broken pipe running `{}`", command)))
            }
            Response::Hang => std::future::pending().await,
        }
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), ConnectionError> {
        self.check_open()?;
        if self.host.take_torn_write(path) {
            self.host.put_file(path, &content[..content.len() / 2]);
            return Err(ConnectionError::ConnectionLost(format!("broken pipe writing {}", path)));
        }
        self.host.put_file(path, content);
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Option<Vec<u8>>, ConnectionError> {
        self.check_open()?;
        Ok(self.host.file(path))
    }

    async fn probe(&self) -> Result<(), ConnectionError> {
        self.check_open()?;
        if self.host.fail_probes.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionLost("probe timed out".into()));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Connector handing out `MockShell`s
#[derive(Default)]
pub struct MockConnector {
    hosts: DashMap<NodeId, Arc<MockHost>>,
    shells: Mutex<Vec<Arc<MockShell>>>,
    connects: AtomicUsize,
    fail_next: AtomicU32,
    reject_auth: AtomicBool,
    connect_delay: Duration,
    exec_delay: Duration,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every handshake takes `delay`
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Every command takes `delay`
    pub fn with_exec_delay(mut self, delay: Duration) -> Self {
        self.exec_delay = delay;
        self
    }

    /// Host state for a node, created on first use
    pub fn host(&self, id: &str) -> Arc<MockHost> {
        Arc::clone(&self.hosts.entry(NodeId::new(id)).or_default())
    }

    /// Refuse the next `n` connection attempts
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Reject authentication on every attempt
    pub fn reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Number of connection attempts so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Shells handed out and not yet closed
    pub fn open_shells(&self) -> usize {
        self.shells
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, node: &Node) -> Result<Arc<dyn RemoteShell>, ConnectionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(ConnectionError::AuthenticationFailed(node.ssh.address()));
        }
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ConnectionError::ConnectionRefused(node.ssh.address()));
        }

        let shell = Arc::new(MockShell {
            host: self.host(node.id.as_str()),
            closed: AtomicBool::new(false),
            exec_delay: self.exec_delay,
        });
        self.shells.lock().unwrap().push(Arc::clone(&shell));
        Ok(shell as Arc<dyn RemoteShell>)
    }
}
