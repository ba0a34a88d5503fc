use crate::log::LogBackend;
use crate::sqlite::SqliteBackend;
use anyhow::Result;
use pm2p::error::MessageError;
use pm2p::message::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Persistence behind a [`crate::MessageStore`].
///
/// `load` returns every persisted record in chronological order; a record
/// that cannot be turned back into a message is reported in place as an
/// `Err` so the store can skip it. `append` must make the record visible to
/// later `load` calls.
pub trait StoreBackend: Send {
    fn load(&mut self) -> Result<Vec<Result<Message, MessageError>>>;

    fn append(&mut self, message: &Message) -> Result<()>;

    /// Human-readable location, for logs.
    fn describe(&self) -> String;
}

/// Which persistence backend a node uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Flat text log of wire forms separated by blank lines.
    #[default]
    Log,
    /// SQLite `messages` table.
    Sqlite,
}

impl BackendKind {
    /// Open this backend inside `state_dir`.
    pub fn open(self, state_dir: &Path) -> Result<Box<dyn StoreBackend>> {
        Ok(match self {
            BackendKind::Log => Box::new(LogBackend::open(state_dir)),
            BackendKind::Sqlite => Box::new(SqliteBackend::open(state_dir)?),
        })
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Log => write!(f, "log"),
            BackendKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "log" => Ok(BackendKind::Log),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(format!("unknown backend `{other}` (expected `log` or `sqlite`)")),
        }
    }
}

/// Volatile backend for nodes that should not touch disk.
#[derive(Default)]
pub struct MemoryBackend {
    records: Vec<Message>,
}

impl MemoryBackend {
    /// Start with `records` already "persisted".
    pub fn with_records(records: Vec<Message>) -> Self {
        Self { records }
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&mut self) -> Result<Vec<Result<Message, MessageError>>> {
        Ok(self.records.iter().cloned().map(Ok).collect())
    }

    fn append(&mut self, message: &Message) -> Result<()> {
        self.records.push(message.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
