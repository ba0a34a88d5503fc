use crate::error::MessageError;
use crate::time::now_secs;
use sha2::{Digest, Sha256};
use std::fmt;

/// Leading text of the identifier line in a message's wire form.
pub const UID_PREFIX: &str = "Message-uid: SHA-256";

const CREATED: &str = "Created:";
const FROM: &str = "From:";
const TO: &str = "To:";
const TOPIC: &str = "Topic:";
const SUBJECT: &str = "Subject:";
const CONTENTS: &str = "Contents:";

/// Addressing headers of a message. Only the sender is mandatory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    pub sender: String,
    pub recipient: Option<String>,
    pub topic: Option<String>,
    pub subject: Option<String>,
}

impl Headers {
    pub fn from_sender(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            ..Default::default()
        }
    }

    pub fn recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Drop empty optional headers and reject values that would break framing.
    fn normalize(mut self) -> Result<Self, MessageError> {
        if self.sender.is_empty() {
            return Err(MessageError::MissingSender);
        }
        check_single_line(&self.sender, "sender")?;
        for (value, name) in [
            (&mut self.recipient, "recipient"),
            (&mut self.topic, "topic"),
            (&mut self.subject, "subject"),
        ] {
            if value.as_deref().is_some_and(str::is_empty) {
                *value = None;
            }
            if let Some(v) = value.as_deref() {
                check_single_line(v, name)?;
            }
        }
        Ok(self)
    }
}

/// An immutable, content-addressed text message.
///
/// The `hash` is always the SHA-256 digest of the canonical serialization of
/// the other fields, so two messages with equal fields share an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    hash: String,
    created: u64,
    headers: Headers,
    contents: Vec<String>,
}

impl Message {
    /// Build a message with an explicit creation time (stored or received messages).
    pub fn new(
        created: u64,
        headers: Headers,
        contents: Vec<String>,
    ) -> Result<Self, MessageError> {
        let headers = headers.normalize()?;
        if contents.is_empty() {
            return Err(MessageError::EmptyContents);
        }
        for line in &contents {
            check_single_line(line, "content line")?;
        }
        let mut msg = Self {
            hash: String::new(),
            created,
            headers,
            contents,
        };
        msg.hash = digest(&msg.serialize());
        Ok(msg)
    }

    /// Author a new message stamped with the current time.
    pub fn compose(headers: Headers, contents: Vec<String>) -> Result<Self, MessageError> {
        Self::new(now_secs(), headers, contents)
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn created(&self) -> u64 {
        self.created
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn sender(&self) -> &str {
        &self.headers.sender
    }

    pub fn recipient(&self) -> Option<&str> {
        self.headers.recipient.as_deref()
    }

    pub fn topic(&self) -> Option<&str> {
        self.headers.topic.as_deref()
    }

    pub fn subject(&self) -> Option<&str> {
        self.headers.subject.as_deref()
    }

    pub fn contents(&self) -> &[String] {
        &self.contents
    }

    /// Canonical serialization: headers in fixed order, then the counted body.
    /// No trailing newline.
    pub fn serialize(&self) -> String {
        self.body_lines().join("\n")
    }

    /// The `Message-uid` line followed by [`Message::serialize`].
    pub fn wire_form(&self) -> String {
        self.wire_lines().join("\n")
    }

    /// The wire form split into its lines, ready to be framed one per write.
    pub fn wire_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.contents.len() + 6);
        lines.push(format!("{UID_PREFIX} {}", self.hash));
        lines.extend(self.body_lines());
        lines
    }

    fn body_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.contents.len() + 5);
        lines.push(format!("{CREATED} {}", self.created));
        lines.push(format!("{FROM} {}", self.headers.sender));
        if let Some(ref to) = self.headers.recipient {
            lines.push(format!("{TO} {to}"));
        }
        if let Some(ref topic) = self.headers.topic {
            lines.push(format!("{TOPIC} {topic}"));
        }
        if let Some(ref subject) = self.headers.subject {
            lines.push(format!("{SUBJECT} {subject}"));
        }
        lines.push(format!("{CONTENTS} {}", self.contents.len()));
        lines.extend(self.contents.iter().cloned());
        lines
    }

    /// Parse a wire form (as produced by [`Message::wire_form`]).
    ///
    /// Everything after the `Contents: N` header is body, whatever it looks
    /// like; N must equal the number of remaining lines.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let lines: Vec<&str> = text.split('\n').map(trim_cr).collect();
        Self::parse_lines(&lines)
    }

    /// Parse a wire form that has already been split into lines.
    pub fn parse_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, MessageError> {
        let mut claimed = None;
        let mut created = None;
        let mut headers = Headers::default();
        let mut sender = None;
        let mut body = None;

        for (i, line) in lines.iter().enumerate() {
            let line = line.as_ref();
            if line.starts_with(UID_PREFIX) {
                let tokens: Vec<&str> = line.split_whitespace().collect();
                if tokens.len() == 3 {
                    claimed = Some(tokens[2].to_ascii_lowercase());
                }
            } else if let Some(value) = header_value(line, CONTENTS) {
                let announced: usize = value.trim().parse().map_err(|_| {
                    MessageError::InvalidHeader {
                        header: "Contents",
                        value: value.to_string(),
                    }
                })?;
                body = Some((i + 1, announced));
                break;
            } else if let Some(value) = header_value(line, CREATED) {
                created = Some(value.trim().parse::<u64>().map_err(|_| {
                    MessageError::InvalidHeader {
                        header: "Created",
                        value: value.to_string(),
                    }
                })?);
            } else if let Some(value) = header_value(line, FROM) {
                sender = Some(value.to_string());
            } else if let Some(value) = header_value(line, TO) {
                headers.recipient = Some(value.to_string());
            } else if let Some(value) = header_value(line, TOPIC) {
                headers.topic = Some(value.to_string());
            } else if let Some(value) = header_value(line, SUBJECT) {
                headers.subject = Some(value.to_string());
            }
        }

        let (start, announced) = body.ok_or(MessageError::MissingHeader("Contents"))?;
        let actual = lines.len() - start;
        if actual != announced {
            return Err(MessageError::ContentsMismatch { announced, actual });
        }
        let created = created.ok_or(MessageError::MissingHeader("Created"))?;
        headers.sender = sender.ok_or(MessageError::MissingHeader("From"))?;
        let contents = lines[start..]
            .iter()
            .map(|l| l.as_ref().to_string())
            .collect();

        let msg = Self::new(created, headers, contents)?;
        if let Some(claimed) = claimed
            && claimed != msg.hash
        {
            return Err(MessageError::HashMismatch {
                claimed,
                computed: msg.hash,
            });
        }
        Ok(msg)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.wire_form())
    }
}

/// SHA-256 over the serialization with each line newline-terminated, as
/// lowercase hex.
pub fn digest(serialized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hasher.update(b"\n");
    hex::encode(hasher.finalize())
}

/// Recognize a `Contents: N` header and return N.
pub fn contents_len(line: &str) -> Option<usize> {
    header_value(line, CONTENTS).and_then(|v| v.trim().parse().ok())
}

/// Split a flat message log into records.
///
/// Records are wire forms separated by a blank line. Bodies are framed by
/// their `Contents: N` count, so a body may itself contain blank lines. A
/// malformed record produces an `Err` entry and scanning resumes after the
/// next blank line.
pub fn parse_log(text: &str) -> Vec<Result<Message, MessageError>> {
    let lines: Vec<&str> = text.split('\n').map(trim_cr).collect();
    let mut records = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        if lines[i].trim().is_empty() {
            i += 1;
            continue;
        }

        let start = i;
        let mut announced = None;
        while i < lines.len() {
            let line = lines[i];
            i += 1;
            if line.trim().is_empty() {
                break;
            }
            if line.starts_with(CONTENTS) {
                announced = Some(contents_len(line));
                break;
            }
        }

        let n = match announced {
            None => {
                records.push(Err(MessageError::MissingHeader("Contents")));
                continue;
            }
            Some(None) => {
                records.push(Err(MessageError::InvalidHeader {
                    header: "Contents",
                    value: lines[i - 1].to_string(),
                }));
                skip_record(&lines, &mut i);
                continue;
            }
            Some(Some(n)) => n,
        };

        let end = i + n;
        if end > lines.len() {
            records.push(Err(MessageError::ContentsMismatch {
                announced: n,
                actual: lines.len() - i,
            }));
            break;
        }
        i = end;

        if i < lines.len() && !lines[i].trim().is_empty() {
            let overflow_start = i;
            skip_record(&lines, &mut i);
            records.push(Err(MessageError::ContentsMismatch {
                announced: n,
                actual: n + (i - overflow_start),
            }));
            continue;
        }

        records.push(Message::parse_lines(&lines[start..end]));
    }

    records
}

fn skip_record(lines: &[&str], i: &mut usize) {
    while *i < lines.len() && !lines[*i].trim().is_empty() {
        *i += 1;
    }
}

fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn trim_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

fn check_single_line(value: &str, field: &'static str) -> Result<(), MessageError> {
    if value.contains(['\n', '\r']) {
        return Err(MessageError::LineBreak(field));
    }
    Ok(())
}
