use thiserror::Error;

/// Failures building or parsing a [`crate::message::Message`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("message sender is required")]
    MissingSender,

    #[error("message contents must not be empty")]
    EmptyContents,

    #[error("{0} must not contain line breaks")]
    LineBreak(&'static str),

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("invalid {header} header: {value}")]
    InvalidHeader { header: &'static str, value: String },

    #[error("contents header announces {announced} lines, found {actual}")]
    ContentsMismatch { announced: usize, actual: usize },

    #[error("message-uid {claimed} does not match computed hash {computed}")]
    HashMismatch { claimed: String, computed: String },
}

/// Failures interpreting a line of the PM protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed ack line: {0}")]
    MalformedAck(String),

    #[error("unsupported protocol version {version} (minimum {minimum})")]
    UnsupportedVersion { version: u32, minimum: u32 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("since {since} is in the future (now {now})")]
    SinceInFuture { since: u64, now: u64 },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}
