use crate::backend::StoreBackend;
use anyhow::{Context, Result};
use pm2p::error::MessageError;
use pm2p::message::{Headers, Message};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

const DB_FILE: &str = "pm2p.db";

/// Row as stored: `(uid, created, sender, recipient, topic, subject, contents)`.
type MessageRow = (
    String,
    i64,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
);

/// SQLite-backed message table.
///
/// Contents are stored newline-joined; every statement binds its values as
/// parameters.
pub struct SqliteBackend {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    /// Open (or create) `pm2p.db` inside `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let path = state_dir.join(DB_FILE);
        let conn = Connection::open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Self::init(conn, Some(path))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory sqlite")?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        // WAL mode for better concurrent read performance
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS messages (
                uid        VARCHAR(64) PRIMARY KEY NOT NULL,
                created    INTEGER NOT NULL,
                sender     TEXT NOT NULL,
                contents   TEXT NOT NULL,
                recipient  TEXT,
                topic      TEXT,
                subject    TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created);",
        )
        .context("failed to create messages table")?;

        Ok(Self { conn, path })
    }

    fn row_to_message(row: MessageRow) -> Result<Message, MessageError> {
        let (uid, created, sender, recipient, topic, subject, contents) = row;
        let created = u64::try_from(created).map_err(|_| MessageError::InvalidHeader {
            header: "Created",
            value: created.to_string(),
        })?;
        let headers = Headers {
            sender,
            recipient,
            topic,
            subject,
        };
        let contents = contents.split('\n').map(str::to_string).collect();
        let msg = Message::new(created, headers, contents)?;
        if msg.hash() != uid {
            return Err(MessageError::HashMismatch {
                claimed: uid,
                computed: msg.hash().to_string(),
            });
        }
        Ok(msg)
    }
}

impl StoreBackend for SqliteBackend {
    fn load(&mut self) -> Result<Vec<Result<Message, MessageError>>> {
        let mut stmt = self.conn.prepare(
            "SELECT uid, created, sender, recipient, topic, subject, contents
                 FROM messages ORDER BY created, rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<MessageRow>>>()
            .context("failed to read messages table")?;
        Ok(rows.into_iter().map(Self::row_to_message).collect())
    }

    fn append(&mut self, message: &Message) -> Result<()> {
        let created = i64::try_from(message.created()).context("created out of range")?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO messages
                     (uid, created, sender, recipient, topic, subject, contents)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    message.hash(),
                    created,
                    message.sender(),
                    message.recipient(),
                    message.topic(),
                    message.subject(),
                    message.contents().join("\n"),
                ],
            )
            .context("failed to insert message")?;
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => "sqlite::memory".to_string(),
        }
    }
}
