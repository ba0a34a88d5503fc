use crate::handler::{NodeState, handle_request};
use futures_util::{SinkExt, StreamExt};
use pm2p::protocol::{Ack, MAX_LINE_BYTES, Presence, Request};
use pm2p::time::now_secs;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

pub type SessionId = u64;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outgoing,
}

/// What a session does once connected.
#[derive(Debug)]
pub enum Role {
    /// A remote node dialed us; we answer its requests.
    Inbound,
    /// We dialed a remote node; lines flow both ways unanswered. Local
    /// request lines arrive on the channel, and closing it ends the session.
    Outgoing(mpsc::UnboundedReceiver<String>),
}

impl Role {
    pub fn direction(&self) -> Direction {
        match self {
            Role::Inbound => Direction::Inbound,
            Role::Outgoing(_) => Direction::Outgoing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Acknowledged,
    Closed,
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer's ack was malformed or below the minimum version.
    HandshakeFailed,
    /// `QUIT!` on an inbound session, or a clean close of an outgoing one.
    Quit,
    /// The peer broke the request grammar.
    Kicked,
    /// I/O failure, idle timeout, or node shutdown.
    Dropped,
}

impl SessionEnd {
    /// The presence notice for an acknowledged peer, if any.
    fn farewell(self) -> Option<Presence> {
        match self {
            SessionEnd::HandshakeFailed => None,
            SessionEnd::Quit => Some(Presence::Left),
            SessionEnd::Kicked => Some(Presence::Kicked),
            SessionEnd::Dropped => Some(Presence::Disconnected),
        }
    }

    /// Whether the notice is also written to the peer. A dropped peer can't
    /// read it.
    fn reaches_peer(self) -> bool {
        matches!(self, SessionEnd::Quit | SessionEnd::Kicked)
    }
}

/// Lifecycle facts a session reports back to whoever spawned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionReport {
    Joined {
        id: SessionId,
        identifier: String,
    },
    Closed {
        id: SessionId,
        direction: Direction,
        end: SessionEnd,
    },
}

/// What a session shares with the rest of the node.
#[derive(Clone)]
pub struct SessionContext {
    pub node: Arc<NodeState>,
    pub reports: mpsc::UnboundedSender<SessionReport>,
    pub shutdown: CancellationToken,
}

/// A byte stream split for line framing, plus the address of the far end.
pub struct Link<R, W> {
    pub reader: R,
    pub writer: W,
    pub remote_addr: String,
}

impl Link<OwnedReadHalf, OwnedWriteHalf> {
    /// Split a TCP stream. Also returns the local address.
    pub fn tcp(stream: TcpStream) -> io::Result<(Self, String)> {
        let local = stream.local_addr()?.to_string();
        let remote_addr = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok((
            Self {
                reader,
                writer,
                remote_addr,
            },
            local,
        ))
    }
}

/// One PM conversation over one connection.
pub struct Session<R, W> {
    id: SessionId,
    announcement: String,
    reader: FramedRead<R, LinesCodec>,
    writer: FramedWrite<W, LinesCodec>,
    remote_addr: String,
    peer: Option<String>,
    state: SessionState,
    ctx: SessionContext,
}

impl<R, W> Session<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// `announcement` is what our ack carries: the listening address on the
    /// inbound side, the caller's chosen identifier on the outgoing side.
    pub fn new(
        id: SessionId,
        announcement: impl Into<String>,
        link: Link<R, W>,
        ctx: SessionContext,
    ) -> Self {
        Self {
            id,
            announcement: announcement.into(),
            reader: FramedRead::new(link.reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            writer: FramedWrite::new(link.writer, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            remote_addr: link.remote_addr,
            peer: None,
            state: SessionState::Connected,
            ctx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion in the given role.
    pub async fn run(mut self, role: Role) -> SessionEnd {
        let direction = role.direction();
        let end = match role {
            Role::Inbound => self.serve().await,
            Role::Outgoing(outbound) => self.drive(outbound).await,
        };
        self.finish(direction, end).await;
        end
    }

    async fn finish(mut self, direction: Direction, end: SessionEnd) {
        if let (Some(peer), Some(presence)) = (self.peer.take(), end.farewell()) {
            let notice = presence.line(&peer, &self.remote_addr);
            if end.reaches_peer() {
                self.send_lines(std::slice::from_ref(&notice)).await;
            }
            self.notify(&notice, None);
            tracing::info!(peer = %peer, remote = %self.remote_addr, ?end, "peer session closed");
        } else {
            tracing::debug!(remote = %self.remote_addr, ?direction, ?end, "session closed");
        }
        self.state = SessionState::Closed;
        let Self {
            id,
            reader,
            writer,
            ctx,
            ..
        } = self;
        // Release the socket before the report so the slot is only reused
        // once the connection is really gone.
        drop(writer);
        drop(reader);
        let _ = ctx.reports.send(SessionReport::Closed { id, direction, end });
    }

    /// Inbound role: handshake, then answer requests until the peer leaves.
    async fn serve(&mut self) -> SessionEnd {
        let ours = self.ack().to_string();
        if !self.send_lines(std::slice::from_ref(&ours)).await {
            return SessionEnd::Dropped;
        }
        self.notify(&ours, None);

        let Some(line) = self.read_line().await else {
            return SessionEnd::Dropped;
        };
        let min_version = self.ctx.node.settings.min_version;
        let parsed = Ack::parse(&line).and_then(|ack| ack.check_version(min_version).map(|()| ack));
        let ack = match parsed {
            Ok(ack) => ack,
            Err(e) => {
                self.notify(&line, Some(self.remote_addr.as_str()));
                tracing::warn!(remote = %self.remote_addr, err = %e, "handshake failed");
                return SessionEnd::HandshakeFailed;
            }
        };
        self.notify(&line, Some(ack.identifier.as_str()));
        self.state = SessionState::Acknowledged;

        let joined = Presence::Joined.line(&ack.identifier, &self.remote_addr);
        self.peer = Some(ack.identifier.clone());
        if !self.send_lines(std::slice::from_ref(&joined)).await {
            return SessionEnd::Dropped;
        }
        self.notify(&joined, None);
        let _ = self.ctx.reports.send(SessionReport::Joined {
            id: self.id,
            identifier: ack.identifier.clone(),
        });
        tracing::info!(
            peer = %ack.identifier,
            remote = %self.remote_addr,
            version = ack.version,
            "peer joined"
        );

        self.request_loop(&ack.identifier).await
    }

    /// Our ack announces the lowest version we accept from the other side.
    fn ack(&self) -> Ack {
        Ack {
            version: self.ctx.node.settings.min_version,
            identifier: self.announcement.clone(),
        }
    }

    async fn request_loop(&mut self, peer: &str) -> SessionEnd {
        loop {
            let Some(line) = self.read_line().await else {
                return SessionEnd::Dropped;
            };
            self.notify(&line, Some(peer));

            let parsed = Request::parse(&line).and_then(|req| req.check(now_secs()).map(|()| req));
            let request = match parsed {
                Ok(req) => req,
                Err(e) => {
                    tracing::warn!(peer = %peer, err = %e, "protocol violation");
                    return SessionEnd::Kicked;
                }
            };

            // The line count comes from the peer; grow as lines arrive.
            let mut payload = Vec::new();
            for _ in 0..request.payload_lines() {
                let Some(line) = self.read_line().await else {
                    return SessionEnd::Dropped;
                };
                self.notify(&line, Some(peer));
                payload.push(line);
            }
            let filter = (!payload.is_empty()).then(|| payload.join("\n"));

            let Some(resp) = handle_request(&self.ctx.node, &request, filter.as_deref()) else {
                return SessionEnd::Quit;
            };
            let lines = resp.lines();
            if !self.send_lines(&lines).await {
                return SessionEnd::Dropped;
            }
            for line in &lines {
                self.notify(line, None);
            }
        }
    }

    /// Outgoing role: handshake, then relay remote lines to the observer and
    /// local lines to the remote until either side closes.
    async fn drive(&mut self, mut outbound: mpsc::UnboundedReceiver<String>) -> SessionEnd {
        let remote = self.remote_addr.clone();
        let ours = self.ack().to_string();
        if !self.send_lines(std::slice::from_ref(&ours)).await {
            return SessionEnd::Dropped;
        }
        self.notify(&ours, None);

        let Some(line) = self.read_line().await else {
            return SessionEnd::Dropped;
        };
        self.notify(&line, Some(remote.as_str()));
        let min_version = self.ctx.node.settings.min_version;
        if let Err(e) = Ack::parse(&line).and_then(|ack| ack.check_version(min_version)) {
            tracing::warn!(remote = %remote, err = %e, "remote ack rejected");
            return SessionEnd::HandshakeFailed;
        }
        self.state = SessionState::Acknowledged;
        tracing::info!(remote = %remote, "outgoing session established");

        let mut quit_sent = false;
        loop {
            tokio::select! {
                line = self.read_line() => match line {
                    Some(line) => self.notify(&line, Some(remote.as_str())),
                    None if quit_sent => return SessionEnd::Quit,
                    None => return SessionEnd::Dropped,
                },
                cmd = outbound.recv() => match cmd {
                    Some(line) => {
                        if !self.send_lines(std::slice::from_ref(&line)).await {
                            return SessionEnd::Dropped;
                        }
                        self.notify(&line, None);
                        quit_sent |= line == Request::Quit.to_string();
                    }
                    None => return SessionEnd::Quit,
                },
            }
        }
    }

    /// Next line from the peer. `None` on EOF, read error, idle timeout, or
    /// shutdown.
    async fn read_line(&mut self) -> Option<String> {
        let idle = self.ctx.node.settings.idle_timeout;
        let reader = &mut self.reader;
        let next = async move {
            match idle {
                Some(limit) => tokio::time::timeout(limit, reader.next()).await.ok(),
                None => Some(reader.next().await),
            }
        };
        let result = tokio::select! {
            _ = self.ctx.shutdown.cancelled() => {
                tracing::debug!(remote = %self.remote_addr, "session cancelled by shutdown");
                return None;
            }
            result = next => result,
        };
        match result {
            None => {
                tracing::info!(remote = %self.remote_addr, "idle timeout");
                None
            }
            Some(None) => None,
            Some(Some(Err(e))) => {
                tracing::debug!(remote = %self.remote_addr, err = %e, "read failed");
                None
            }
            Some(Some(Ok(line))) => Some(line),
        }
    }

    /// Write lines and flush. Returns false if the connection is gone.
    async fn send_lines(&mut self, lines: &[String]) -> bool {
        for line in lines {
            if let Err(e) = self.writer.feed(line.clone()).await {
                tracing::debug!(remote = %self.remote_addr, err = %e, "write failed");
                return false;
            }
        }
        if let Err(e) = SinkExt::<String>::flush(&mut self.writer).await {
            tracing::debug!(remote = %self.remote_addr, err = %e, "flush failed");
            return false;
        }
        true
    }

    fn notify(&self, line: &str, origin: Option<&str>) {
        self.ctx.node.observer.notify(line, origin);
    }
}
