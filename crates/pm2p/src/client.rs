use crate::error::ProtocolError;
use crate::message::{Message, contents_len};
use crate::protocol::{Ack, HELP_TEXT, MAX_LINE_BYTES, MIN_PROTOCOL_VERSION, Request};
use anyhow::{Context, Result, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::ToSocketAddrs;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// A remote party speaking PM to a node over TCP.
///
/// Used by scripts and tests to drive a node's inbound side the way another
/// node's outgoing connection would.
pub struct PeerClient {
    reader: FramedRead<OwnedReadHalf, LinesCodec>,
    writer: FramedWrite<OwnedWriteHalf, LinesCodec>,
    remote: Option<Ack>,
}

impl PeerClient {
    /// Open a TCP connection without performing the handshake.
    pub async fn open(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("failed to connect to node")?;
        let (r, w) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            writer: FramedWrite::new(w, LinesCodec::new_with_max_length(MAX_LINE_BYTES)),
            remote: None,
        })
    }

    /// Connect and complete the handshake, announcing `identifier`.
    pub async fn connect(addr: impl ToSocketAddrs, identifier: &str) -> Result<Self> {
        let mut client = Self::open(addr).await?;
        client.handshake(identifier, MIN_PROTOCOL_VERSION).await?;
        Ok(client)
    }

    /// Read the node's ack, answer with our own and wait for the `joined` notice.
    /// Returns the notice.
    pub async fn handshake(&mut self, identifier: &str, version: u32) -> Result<String> {
        let line = self.next_line().await?;
        let remote = Ack::parse(&line)?;
        let ours = Ack {
            version,
            identifier: identifier.to_string(),
        };
        self.send_line(ours.to_string()).await?;
        let joined = self.next_line().await?;
        if !joined.ends_with(" joined") {
            bail!(ProtocolError::UnexpectedResponse(joined));
        }
        self.remote = Some(remote);
        Ok(joined)
    }

    /// The ack the node announced itself with, once the handshake completed.
    pub fn remote(&self) -> Option<&Ack> {
        self.remote.as_ref()
    }

    pub async fn send_line(&mut self, line: impl Into<String>) -> Result<()> {
        self.writer.send(line.into()).await?;
        Ok(())
    }

    /// Read one line; `None` once the node has closed the connection.
    pub async fn try_next_line(&mut self) -> Result<Option<String>> {
        match self.reader.next().await {
            Some(line) => Ok(Some(line?)),
            None => Ok(None),
        }
    }

    pub async fn next_line(&mut self) -> Result<String> {
        let Some(line) = self.try_next_line().await? else {
            bail!("node disconnected");
        };
        Ok(line)
    }

    pub async fn help(&mut self) -> Result<Vec<String>> {
        self.send_line(Request::Help.to_string()).await?;
        let mut lines = Vec::with_capacity(HELP_TEXT.len());
        for _ in 0..HELP_TEXT.len() {
            lines.push(self.next_line().await?);
        }
        Ok(lines)
    }

    pub async fn time(&mut self) -> Result<u64> {
        self.send_line(Request::Time.to_string()).await?;
        let line = self.next_line().await?;
        line.strip_prefix("NOW ")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProtocolError::UnexpectedResponse(line.clone()).into())
    }

    /// `LOAD?` a message by hash; `None` on `NOT FOUND`.
    pub async fn load(&mut self, hash: &str) -> Result<Option<Message>> {
        self.send_line(format!("LOAD? {hash}")).await?;
        let line = self.next_line().await?;
        match line.as_str() {
            "NOT FOUND" => Ok(None),
            "SUCCESS" => Ok(Some(self.read_message().await?)),
            _ => bail!(ProtocolError::UnexpectedResponse(line)),
        }
    }

    /// `SHOW?` hashes created at or after `since`, optionally filtered by a
    /// multi-line search string sent as payload.
    pub async fn show(&mut self, since: u64, filter: &[&str]) -> Result<Vec<String>> {
        let request = Request::Show {
            since,
            headers: filter.len(),
        };
        self.send_line(request.to_string()).await?;
        for line in filter {
            self.send_line(*line).await?;
        }
        let line = self.next_line().await?;
        if line == "NONE" {
            return Ok(Vec::new());
        }
        let count: usize = line
            .strip_prefix("ENTRIES ")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProtocolError::UnexpectedResponse(line.clone()))?;
        // `count` is whatever the node claims; only what arrives is kept.
        let mut hashes = Vec::new();
        for _ in 0..count {
            hashes.push(self.next_line().await?);
        }
        Ok(hashes)
    }

    /// Send `QUIT!` and return the node's farewell line.
    pub async fn quit(&mut self) -> Result<String> {
        self.send_line(Request::Quit.to_string()).await?;
        self.next_line().await
    }

    /// Read one wire-form message, framed by its `Contents: N` header.
    pub async fn read_message(&mut self) -> Result<Message> {
        let mut lines = Vec::new();
        let body = loop {
            let line = self.next_line().await?;
            let n = contents_len(&line);
            lines.push(line);
            if let Some(n) = n {
                break n;
            }
        };
        for _ in 0..body {
            lines.push(self.next_line().await?);
        }
        Ok(Message::parse_lines(&lines)?)
    }
}
