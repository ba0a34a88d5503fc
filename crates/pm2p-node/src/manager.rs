use crate::handler::NodeState;
use crate::session::{Direction, Link, Role, Session, SessionContext, SessionId, SessionReport};
use anyhow::{Context, Result};
use pm2p::error::ProtocolError;
use pm2p::protocol::OutboundFramer;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("already connected to {0}")]
    AlreadyConnected(String),
    #[error("not connected")]
    NotConnected,
    #[error("refused to send: {0}")]
    Refused(#[from] ProtocolError),
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection manager has stopped")]
    Stopped,
}

/// An inbound peer as the manager sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: SessionId,
    pub address: String,
    /// Known once the peer's ack has been accepted.
    pub identifier: Option<String>,
}

enum Command {
    Accepted(TcpStream),
    Connect {
        identifier: String,
        host: String,
        port: u16,
        reply: oneshot::Sender<Result<String, ManagerError>>,
    },
    Disconnect {
        reply: oneshot::Sender<bool>,
    },
    Send {
        line: String,
        reply: oneshot::Sender<Result<(), ManagerError>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    Outgoing {
        reply: oneshot::Sender<Option<String>>,
    },
}

/// Handle to a node's listener, inbound peers and single outgoing slot.
///
/// All bookkeeping lives in one task; handles only exchange messages with it,
/// so the peer set and the outgoing slot never need a lock.
#[derive(Clone)]
pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Bind the listener and start accepting. Every inbound connection is
    /// served regardless of the outgoing slot.
    pub async fn bind(node: Arc<NodeState>, addr: impl ToSocketAddrs) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind PM listener")?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "PM listener started");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (reports, report_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let book = Bookkeeper {
            ctx: SessionContext {
                node,
                reports,
                shutdown: shutdown.child_token(),
            },
            next_id: 0,
            peers: HashMap::new(),
            outgoing: None,
        };
        tokio::spawn(book.run(command_rx, report_rx, shutdown.clone()));
        tokio::spawn(accept_loop(listener, commands.clone(), shutdown.clone()));

        Ok(Self {
            commands,
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open the outgoing connection, announcing `identifier`. Returns the
    /// remote address.
    pub async fn connect(
        &self,
        identifier: &str,
        host: &str,
        port: u16,
    ) -> Result<String, ManagerError> {
        self.call(|reply| Command::Connect {
            identifier: identifier.to_string(),
            host: host.to_string(),
            port,
            reply,
        })
        .await?
    }

    /// Close the outgoing connection. Returns false if there was none.
    pub async fn disconnect(&self) -> Result<bool, ManagerError> {
        self.call(|reply| Command::Disconnect { reply }).await
    }

    /// Forward one local line over the outgoing connection. Lines that break
    /// the request grammar are refused and the connection stays open.
    pub async fn send_request(&self, line: &str) -> Result<(), ManagerError> {
        self.call(|reply| Command::Send {
            line: line.to_string(),
            reply,
        })
        .await?
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>, ManagerError> {
        self.call(|reply| Command::Peers { reply }).await
    }

    /// Remote address of the outgoing connection, if one is open.
    pub async fn outgoing(&self) -> Result<Option<String>, ManagerError> {
        self.call(|reply| Command::Outgoing { reply }).await
    }

    pub async fn is_connected(&self) -> bool {
        matches!(self.outgoing().await, Ok(Some(_)))
    }

    /// Stop accepting and end every session.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ManagerError::Stopped)?;
        rx.await.map_err(|_| ManagerError::Stopped)
    }
}

struct OutgoingSlot {
    id: SessionId,
    remote: String,
    lines: mpsc::UnboundedSender<String>,
    framer: OutboundFramer,
}

struct Bookkeeper {
    ctx: SessionContext,
    next_id: SessionId,
    peers: HashMap<SessionId, PeerInfo>,
    outgoing: Option<OutgoingSlot>,
}

impl Bookkeeper {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<SessionReport>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(report) = reports.recv() => self.on_report(report),
                Some(command) = commands.recv() => self.on_command(command).await,
                else => break,
            }
        }
        tracing::debug!("connection manager stopped");
    }

    fn allocate_id(&mut self) -> SessionId {
        self.next_id += 1;
        self.next_id
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Accepted(stream) => self.accept(stream),
            Command::Connect {
                identifier,
                host,
                port,
                reply,
            } => {
                let _ = reply.send(self.connect(identifier, &host, port).await);
            }
            Command::Disconnect { reply } => {
                let _ = reply.send(self.disconnect());
            }
            Command::Send { line, reply } => {
                let _ = reply.send(self.forward(line));
            }
            Command::Peers { reply } => {
                let mut peers: Vec<PeerInfo> = self.peers.values().cloned().collect();
                peers.sort_by_key(|p| p.id);
                let _ = reply.send(peers);
            }
            Command::Outgoing { reply } => {
                let _ = reply.send(self.outgoing.as_ref().map(|slot| slot.remote.clone()));
            }
        }
    }

    fn accept(&mut self, stream: TcpStream) {
        let (link, local) = match Link::tcp(stream) {
            Ok(split) => split,
            Err(e) => {
                tracing::warn!(err = %e, "dropping inbound connection");
                return;
            }
        };
        let id = self.allocate_id();
        let was_empty = self.peers.is_empty();
        self.peers.insert(
            id,
            PeerInfo {
                id,
                address: link.remote_addr.clone(),
                identifier: None,
            },
        );
        if was_empty {
            self.ctx.node.observer.peers_active();
        }
        tracing::debug!(id, remote = %link.remote_addr, "inbound connection accepted");
        let session = Session::new(id, local, link, self.ctx.clone());
        tokio::spawn(session.run(Role::Inbound));
    }

    async fn connect(
        &mut self,
        identifier: String,
        host: &str,
        port: u16,
    ) -> Result<String, ManagerError> {
        if let Some(slot) = &self.outgoing {
            return Err(ManagerError::AlreadyConnected(slot.remote.clone()));
        }
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|source| ManagerError::Connect {
                addr: format!("{host}:{port}"),
                source,
            })?;
        let (link, _) = Link::tcp(stream).map_err(|source| ManagerError::Connect {
            addr: format!("{host}:{port}"),
            source,
        })?;
        let remote = link.remote_addr.clone();
        let id = self.allocate_id();
        let (lines, lines_rx) = mpsc::unbounded_channel();
        let session = Session::new(id, identifier, link, self.ctx.clone());
        tokio::spawn(session.run(Role::Outgoing(lines_rx)));

        self.outgoing = Some(OutgoingSlot {
            id,
            remote: remote.clone(),
            lines,
            framer: OutboundFramer::default(),
        });
        tracing::info!(id, %remote, "outgoing connection opened");
        self.ctx.node.observer.outgoing_connected(&remote);
        Ok(remote)
    }

    /// Frees the slot at once. The session's own close report is then stale
    /// and ignored.
    fn disconnect(&mut self) -> bool {
        let Some(slot) = self.outgoing.take() else {
            return false;
        };
        tracing::info!(id = slot.id, remote = %slot.remote, "outgoing connection closed locally");
        drop(slot.lines);
        self.ctx.node.observer.outgoing_disconnected();
        true
    }

    fn forward(&mut self, line: String) -> Result<(), ManagerError> {
        let slot = self.outgoing.as_mut().ok_or(ManagerError::NotConnected)?;
        slot.framer.admit(&line)?;
        slot.lines.send(line).map_err(|_| ManagerError::NotConnected)
    }

    fn on_report(&mut self, report: SessionReport) {
        match report {
            SessionReport::Joined { id, identifier } => {
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.identifier = Some(identifier);
                }
            }
            SessionReport::Closed {
                id,
                direction: Direction::Inbound,
                ..
            } => {
                if self.peers.remove(&id).is_some() && self.peers.is_empty() {
                    self.ctx.node.observer.peers_drained();
                }
            }
            SessionReport::Closed {
                id,
                direction: Direction::Outgoing,
                end,
            } => {
                if self.outgoing.as_ref().is_some_and(|slot| slot.id == id) {
                    self.outgoing = None;
                    tracing::info!(id, ?end, "outgoing connection ended");
                    self.ctx.node.observer.outgoing_disconnected();
                }
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    commands: mpsc::UnboundedSender<Command>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::debug!(%remote, "client connected");
                    if commands.send(Command::Accepted(stream)).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::warn!(err = %e, "accept failed"),
            },
        }
    }
    tracing::debug!("PM listener stopped");
}
