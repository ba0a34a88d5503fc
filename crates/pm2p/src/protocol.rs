use crate::error::ProtocolError;
use crate::message::Message;
use std::fmt;

/// Lowest PM protocol version a node will talk to, and the version it announces.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Maximum size of a single line on a PM connection (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Literal prefix of the handshake line.
pub const ACK_PREFIX: &str = "ACK? PM/";

/// Response to `HELP?`.
pub const HELP_TEXT: [&str; 10] = [
    "Requests supported in PM (v1)",
    "HELP?\tDisplays this message",
    "TIME?\tReturns the current time (in Unix Epoch) at the receiving peer",
    "LOAD? <hash>",
    "  \tRetrieves a stored message object from the peer by its unique identifier",
    "  \t`hash`, which is equivalent to the message body's SHA-256 sum",
    "SHOW? <since> <headers>",
    "  \tLists the SHA-256 sum of all message objects created on or after `since`",
    "  \tand contain the contents specified by `headers`",
    "QUIT!\tEnds the communication between two peers politely",
];

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// The `ACK? PM/<version> <identifier>` line both sides open a connection with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub version: u32,
    pub identifier: String,
}

impl Ack {
    /// An ack announcing `identifier` at the version this node speaks.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            version: MIN_PROTOCOL_VERSION,
            identifier: identifier.into(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let malformed = || ProtocolError::MalformedAck(line.to_string());
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 3 || !line.starts_with(ACK_PREFIX) {
            return Err(malformed());
        }
        let version = tokens[1]
            .split_once('/')
            .and_then(|(_, v)| v.parse::<u32>().ok())
            .ok_or_else(malformed)?;
        Ok(Self {
            version,
            identifier: tokens[2].to_string(),
        })
    }

    /// Reject acks below `minimum`.
    pub fn check_version(&self, minimum: u32) -> Result<(), ProtocolError> {
        if self.version < minimum {
            return Err(ProtocolError::UnsupportedVersion {
                version: self.version,
                minimum,
            });
        }
        Ok(())
    }
}

impl fmt::Display for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{ACK_PREFIX}{} {}", self.version, self.identifier)
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// A request sent by a peer once the handshake has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Help,
    Time,
    Load {
        hash: String,
    },
    /// `headers` counts the search-content lines that follow the request.
    Show {
        since: u64,
        headers: usize,
    },
    Quit,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        match line {
            "HELP?" => return Ok(Self::Help),
            "TIME?" => return Ok(Self::Time),
            "QUIT!" => return Ok(Self::Quit),
            _ => {}
        }

        let invalid = || ProtocolError::InvalidRequest(line.to_string());
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["LOAD?", hash] => Ok(Self::Load {
                hash: hash.to_string(),
            }),
            ["SHOW?", since, headers] => Ok(Self::Show {
                since: since.parse().map_err(|_| invalid())?,
                headers: headers.parse().map_err(|_| invalid())?,
            }),
            _ => Err(invalid()),
        }
    }

    /// Number of payload lines the sender transmits after this request.
    pub fn payload_lines(&self) -> usize {
        match self {
            Self::Show { headers, .. } => *headers,
            _ => 0,
        }
    }

    /// Range checks that depend on the receiving node's clock.
    pub fn check(&self, now: u64) -> Result<(), ProtocolError> {
        match self {
            Self::Show { since, .. } if *since > now => Err(ProtocolError::SinceInFuture {
                since: *since,
                now,
            }),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Help => f.write_str("HELP?"),
            Self::Time => f.write_str("TIME?"),
            Self::Load { hash } => write!(f, "LOAD? {hash}"),
            Self::Show { since, headers } => write!(f, "SHOW? {since} {headers}"),
            Self::Quit => f.write_str("QUIT!"),
        }
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// A response to a [`Request`]. `QUIT!` has none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Help,
    Now(u64),
    Success(Box<Message>),
    NotFound,
    Entries(Vec<String>),
    NoEntries,
}

impl Response {
    /// `ENTRIES` when any hash matched, `NONE` otherwise.
    pub fn entries(hashes: Vec<String>) -> Self {
        if hashes.is_empty() {
            Self::NoEntries
        } else {
            Self::Entries(hashes)
        }
    }

    /// The response as wire lines, one per frame.
    pub fn lines(&self) -> Vec<String> {
        match self {
            Self::Help => HELP_TEXT.iter().map(|l| l.to_string()).collect(),
            Self::Now(secs) => vec![format!("NOW {secs}")],
            Self::Success(msg) => {
                let mut lines = vec!["SUCCESS".to_string()];
                lines.extend(msg.wire_lines());
                lines
            }
            Self::NotFound => vec!["NOT FOUND".to_string()],
            Self::Entries(hashes) => {
                let mut lines = vec![format!("ENTRIES {}", hashes.len())];
                lines.extend(hashes.iter().cloned());
                lines
            }
            Self::NoEntries => vec!["NONE".to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Presence notices
// ---------------------------------------------------------------------------

/// Lines announcing a peer's arrival or departure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Joined,
    Left,
    Kicked,
    Disconnected,
}

impl Presence {
    pub fn line(self, identifier: &str, address: &str) -> String {
        let verb = match self {
            Self::Joined => "joined",
            Self::Left => "left",
            Self::Kicked => "was kicked",
            Self::Disconnected => "disconnected",
        };
        format!("{identifier} ({address}) {verb}")
    }
}

// ---------------------------------------------------------------------------
// Client-side framing
// ---------------------------------------------------------------------------

/// Validates lines a local user wants to send to a remote node.
///
/// After a `SHOW? <since> <k>` request the next `k` lines are search payload
/// and pass through unchecked.
#[derive(Debug, Default)]
pub struct OutboundFramer {
    pending_payload: usize,
}

impl OutboundFramer {
    pub fn admit(&mut self, line: &str) -> Result<(), ProtocolError> {
        if self.pending_payload > 0 {
            self.pending_payload -= 1;
            return Ok(());
        }
        let request = Request::parse(line)?;
        self.pending_payload = request.payload_lines();
        Ok(())
    }

    /// Payload lines still expected for the last `SHOW?`.
    pub fn pending_payload(&self) -> usize {
        self.pending_payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Headers;

    #[test]
    fn ack_round_trip() {
        let ack = Ack::new("@alice");
        assert_eq!(ack.to_string(), "ACK? PM/1 @alice");
        assert_eq!(Ack::parse("ACK? PM/1 @alice").unwrap(), ack);
    }

    #[test]
    fn ack_parses_higher_versions() {
        let ack = Ack::parse("ACK? PM/7 peer").unwrap();
        assert_eq!(ack.version, 7);
        assert!(ack.check_version(MIN_PROTOCOL_VERSION).is_ok());
    }

    #[test]
    fn ack_below_minimum_is_rejected() {
        let ack = Ack::parse("ACK? PM/0 peerA").unwrap();
        assert_eq!(
            ack.check_version(1),
            Err(ProtocolError::UnsupportedVersion {
                version: 0,
                minimum: 1
            })
        );
    }

    #[test]
    fn malformed_acks() {
        for line in [
            "ACK? PM/1",
            "ACK? PM/1 a b",
            "ACK PM/1 a",
            "HELLO PM/1 a",
            "ACK? PM/x a",
            "ACK? PM/-1 a",
            "",
        ] {
            assert!(
                matches!(Ack::parse(line), Err(ProtocolError::MalformedAck(_))),
                "{line:?} should be rejected"
            );
        }
    }

    #[test]
    fn parses_exact_requests() {
        assert_eq!(Request::parse("HELP?").unwrap(), Request::Help);
        assert_eq!(Request::parse("TIME?").unwrap(), Request::Time);
        assert_eq!(Request::parse("QUIT!").unwrap(), Request::Quit);
        assert!(Request::parse("HELP? now").is_err());
        assert!(Request::parse("help?").is_err());
    }

    #[test]
    fn parses_load_and_show() {
        assert_eq!(
            Request::parse("LOAD? abc").unwrap(),
            Request::Load { hash: "abc".into() }
        );
        assert_eq!(
            Request::parse("SHOW? 0 2").unwrap(),
            Request::Show {
                since: 0,
                headers: 2
            }
        );
        assert!(Request::parse("LOAD?").is_err());
        assert!(Request::parse("LOAD? a b").is_err());
        assert!(Request::parse("LOAD?x abc").is_err());
        assert!(Request::parse("SHOW? -1 0").is_err());
        assert!(Request::parse("SHOW? 0 -3").is_err());
        assert!(Request::parse("SHOW? soon 0").is_err());
        assert!(Request::parse("SHOW? 0").is_err());
    }

    #[test]
    fn show_since_must_not_be_future() {
        let req = Request::parse("SHOW? 200 0").unwrap();
        assert!(req.check(200).is_ok());
        assert_eq!(
            req.check(199),
            Err(ProtocolError::SinceInFuture {
                since: 200,
                now: 199
            })
        );
    }

    #[test]
    fn request_display_matches_grammar() {
        for line in ["HELP?", "TIME?", "QUIT!", "LOAD? ff", "SHOW? 10 3"] {
            assert_eq!(Request::parse(line).unwrap().to_string(), line);
        }
    }

    #[test]
    fn response_lines() {
        assert_eq!(Response::Now(5).lines(), vec!["NOW 5"]);
        assert_eq!(Response::NotFound.lines(), vec!["NOT FOUND"]);
        assert_eq!(Response::entries(vec![]).lines(), vec!["NONE"]);
        assert_eq!(
            Response::entries(vec!["a".into(), "b".into()]).lines(),
            vec!["ENTRIES 2", "a", "b"]
        );
        assert_eq!(Response::Help.lines().len(), HELP_TEXT.len());

        let msg = Message::new(1, Headers::from_sender("@a"), vec!["x".into()]).unwrap();
        let lines = Response::Success(Box::new(msg.clone())).lines();
        assert_eq!(lines[0], "SUCCESS");
        assert_eq!(lines[1..].join("\n"), msg.wire_form());
    }

    #[test]
    fn presence_lines() {
        assert_eq!(
            Presence::Joined.line("@a", "127.0.0.1:5000"),
            "@a (127.0.0.1:5000) joined"
        );
        assert_eq!(Presence::Kicked.line("@a", "h"), "@a (h) was kicked");
        assert_eq!(Presence::Left.line("@a", "h"), "@a (h) left");
    }

    #[test]
    fn framer_passes_show_payload_through() {
        let mut framer = OutboundFramer::default();
        framer.admit("SHOW? 0 2").unwrap();
        assert_eq!(framer.pending_payload(), 2);
        framer.admit("anything at all").unwrap();
        framer.admit("QUIT").unwrap();
        assert_eq!(framer.pending_payload(), 0);
        assert!(framer.admit("QUIT").is_err());
        framer.admit("QUIT!").unwrap();
    }

    #[test]
    fn framer_rejects_garbage() {
        let mut framer = OutboundFramer::default();
        assert!(framer.admit("GET / HTTP/1.1").is_err());
        assert!(framer.admit("SHOW? x 1").is_err());
        assert_eq!(framer.pending_payload(), 0);
        framer.admit("LOAD? abc").unwrap();
    }
}
