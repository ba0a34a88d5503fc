use crate::config::validate_identifier;
use crate::handler::NodeState;
use crate::manager::ConnectionManager;
use crate::observer::NodeEvent;
use anyhow::Result;
use futures_util::StreamExt;
use pm2p::message::Headers;
use pm2p::protocol::MAX_LINE_BYTES;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::broadcast;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Ends a `/compose` body.
const END_OF_BODY: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Connect {
        identifier: Option<String>,
        host: String,
        port: u16,
    },
    Disconnect,
    Peers,
    List,
    Compose(Headers),
    Quit,
    /// Anything that isn't a slash command goes to the outgoing connection.
    Request(String),
    Invalid(String),
}

pub fn parse_command(line: &str) -> ConsoleCommand {
    let Some(rest) = line.strip_prefix('/') else {
        return ConsoleCommand::Request(line.to_string());
    };
    let mut words = rest.split_whitespace();
    let name = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();
    match (name, args.as_slice()) {
        ("connect", [identifier, host, port]) => parse_connect(Some(*identifier), host, port),
        ("connect", [host, port]) => parse_connect(None, host, port),
        ("connect", _) => {
            ConsoleCommand::Invalid("usage: /connect [identifier] <host> <port>".into())
        }
        ("disconnect", []) => ConsoleCommand::Disconnect,
        ("peers", []) => ConsoleCommand::Peers,
        ("list", []) => ConsoleCommand::List,
        ("quit", []) => ConsoleCommand::Quit,
        ("compose", [sender, options @ ..]) => parse_compose(sender, options),
        ("compose", []) => ConsoleCommand::Invalid(
            "usage: /compose <sender> [to=..] [topic=..] [subject=..]".into(),
        ),
        _ => ConsoleCommand::Invalid(format!("unknown command: /{rest}")),
    }
}

fn parse_connect(identifier: Option<&str>, host: &str, port: &str) -> ConsoleCommand {
    match port.parse() {
        Ok(port) => ConsoleCommand::Connect {
            identifier: identifier.map(str::to_string),
            host: host.to_string(),
            port,
        },
        Err(_) => ConsoleCommand::Invalid(format!("invalid port: {port}")),
    }
}

fn parse_compose(sender: &str, options: &[&str]) -> ConsoleCommand {
    let mut headers = Headers::from_sender(sender);
    for option in options {
        headers = match option.split_once('=') {
            Some(("to", value)) => headers.recipient(value),
            Some(("topic", value)) => headers.topic(value),
            Some(("subject", value)) => headers.subject(value),
            _ => return ConsoleCommand::Invalid(format!("unknown compose option: {option}")),
        };
    }
    ConsoleCommand::Compose(headers)
}

/// What the console loop does after a line.
#[derive(Debug, PartialEq, Eq)]
pub enum Flow {
    Continue(Vec<String>),
    Quit,
}

/// Interactive front-end over a running node.
pub struct Console {
    manager: ConnectionManager,
    node: Arc<NodeState>,
    identifier: Option<String>,
    draft: Option<(Headers, Vec<String>)>,
}

impl Console {
    pub fn new(
        manager: ConnectionManager,
        node: Arc<NodeState>,
        identifier: Option<String>,
    ) -> Self {
        Self {
            manager,
            node,
            identifier,
            draft: None,
        }
    }

    pub async fn handle_line(&mut self, line: &str) -> Flow {
        if let Some((headers, mut contents)) = self.draft.take() {
            if line != END_OF_BODY {
                contents.push(line.to_string());
                self.draft = Some((headers, contents));
                return Flow::Continue(Vec::new());
            }
            let out = match self.node.store.compose(headers, contents) {
                Ok(msg) => format!("stored {}", msg.hash()),
                Err(e) => format!("error: {e:#}"),
            };
            return Flow::Continue(vec![out]);
        }
        if line.trim().is_empty() {
            return Flow::Continue(Vec::new());
        }

        let out = match parse_command(line) {
            ConsoleCommand::Quit => return Flow::Quit,
            ConsoleCommand::Invalid(usage) => vec![usage],
            ConsoleCommand::Connect {
                identifier,
                host,
                port,
            } => vec![self.connect(identifier, &host, port).await],
            ConsoleCommand::Disconnect => match self.manager.disconnect().await {
                Ok(true) => vec!["disconnected".to_string()],
                Ok(false) => vec!["not connected".to_string()],
                Err(e) => vec![format!("error: {e}")],
            },
            ConsoleCommand::Peers => match self.manager.peers().await {
                Ok(peers) if peers.is_empty() => vec!["no peers".to_string()],
                Ok(peers) => peers
                    .into_iter()
                    .map(|p| {
                        format!(
                            "{} {}",
                            p.identifier.as_deref().unwrap_or("(pending)"),
                            p.address
                        )
                    })
                    .collect(),
                Err(e) => vec![format!("error: {e}")],
            },
            ConsoleCommand::List => self
                .node
                .store
                .messages()
                .iter()
                .map(|m| {
                    format!(
                        "{} {} {} {}",
                        m.hash(),
                        m.created(),
                        m.sender(),
                        m.topic().unwrap_or("-")
                    )
                })
                .collect(),
            ConsoleCommand::Compose(headers) => {
                self.draft = Some((headers, Vec::new()));
                vec![format!("enter contents, end with a line containing only {END_OF_BODY}")]
            }
            ConsoleCommand::Request(line) => match self.manager.send_request(&line).await {
                Ok(()) => Vec::new(),
                Err(e) => vec![format!("error: {e}")],
            },
        };
        Flow::Continue(out)
    }

    async fn connect(&self, identifier: Option<String>, host: &str, port: u16) -> String {
        let Some(identifier) = identifier.or_else(|| self.identifier.clone()) else {
            return "no identifier: use /connect <identifier> <host> <port>".to_string();
        };
        if let Err(e) = validate_identifier(&identifier) {
            return format!("error: {e}");
        }
        match self.manager.connect(&identifier, host, port).await {
            Ok(remote) => format!("connecting to {remote} as {identifier}"),
            Err(e) => format!("error: {e}"),
        }
    }
}

/// How an observer event reads on the console.
pub fn format_event(event: &NodeEvent) -> String {
    match event {
        NodeEvent::Activity {
            line,
            origin: Some(origin),
        } => format!("[{origin}] {line}"),
        NodeEvent::Activity { line, origin: None } => format!("> {line}"),
        NodeEvent::OutgoingConnected { remote } => format!("* connected to {remote}"),
        NodeEvent::OutgoingDisconnected => "* outgoing connection closed".to_string(),
        NodeEvent::PeersActive => "* peers connected".to_string(),
        NodeEvent::PeersDrained => "* no peers connected".to_string(),
    }
}

/// Print observer events to stdout until the node goes away.
pub async fn print_events(mut events: broadcast::Receiver<NodeEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => println!("{}", format_event(&event)),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "console fell behind node events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Read commands from `input` until EOF or `/quit`.
pub async fn run<R: AsyncRead + Unpin>(mut console: Console, input: R) -> Result<()> {
    let mut lines = FramedRead::new(input, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    while let Some(line) = lines.next().await {
        match console.handle_line(line?.trim_end()).await {
            Flow::Quit => break,
            Flow::Continue(out) => {
                for line in out {
                    println!("{line}");
                }
            }
        }
    }
    Ok(())
}
