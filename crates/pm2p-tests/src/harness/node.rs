use super::{EVENT_TIMEOUT, init_tracing, wait_for_event};
use anyhow::{Context, Result};
use pm2p::client::PeerClient;
use pm2p_node::handler::{NodeState, SessionSettings};
use pm2p_node::manager::ConnectionManager;
use pm2p_node::observer::{EventObserver, NodeEvent};
use pm2p_store::{BackendKind, MessageStore};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::broadcast;

/// A node listening on an ephemeral loopback port with its own state
/// directory. Shut down on drop.
pub struct TestNode {
    pub state: Arc<NodeState>,
    pub manager: ConnectionManager,
    pub addr: SocketAddr,
    events: broadcast::Receiver<NodeEvent>,
    _state_dir: Option<TempDir>,
}

impl TestNode {
    /// Spawn a node with a log-backed store in a fresh temp directory.
    pub async fn spawn() -> Result<Self> {
        Self::spawn_with(BackendKind::Log, SessionSettings::default()).await
    }

    pub async fn spawn_with(backend: BackendKind, settings: SessionSettings) -> Result<Self> {
        let state_dir = TempDir::new()?;
        let mut node = Self::open(state_dir.path(), backend, settings).await?;
        node._state_dir = Some(state_dir);
        Ok(node)
    }

    /// Spawn a node over an existing state directory the caller keeps alive.
    pub async fn open(
        state_dir: &Path,
        backend: BackendKind,
        settings: SessionSettings,
    ) -> Result<Self> {
        init_tracing();
        let store = MessageStore::open(backend.open(state_dir)?)
            .context("failed to open message store")?;
        let observer = Arc::new(EventObserver::new(1024));
        let events = observer.subscribe();
        let state = NodeState::new(store, observer, settings);
        let manager = ConnectionManager::bind(state.clone(), "127.0.0.1:0").await?;
        let addr = manager.local_addr();
        Ok(Self {
            state,
            manager,
            addr,
            events,
            _state_dir: None,
        })
    }

    /// A client that has completed the handshake as `identifier`.
    pub async fn client(&self, identifier: &str) -> Result<PeerClient> {
        PeerClient::connect(self.addr, identifier).await
    }

    /// Open the outgoing connection to `other`.
    pub async fn connect_to(&self, identifier: &str, other: &TestNode) -> Result<String> {
        Ok(self
            .manager
            .connect(identifier, "127.0.0.1", other.addr.port())
            .await?)
    }

    pub async fn wait_for(&mut self, pred: impl Fn(&NodeEvent) -> bool) -> Result<NodeEvent> {
        wait_for_event(&mut self.events, EVENT_TIMEOUT, pred).await
    }

    /// Wait for an activity line ending in `suffix`, returning the line.
    pub async fn wait_for_line_ending(&mut self, suffix: &str) -> Result<String> {
        match self
            .wait_for(|e| matches!(e, NodeEvent::Activity { line, .. } if line.ends_with(suffix)))
            .await?
        {
            NodeEvent::Activity { line, .. } => Ok(line),
            other => unreachable!("predicate only admits activity, got {other:?}"),
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}
