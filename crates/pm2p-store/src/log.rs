use crate::backend::StoreBackend;
use anyhow::{Context, Result};
use pm2p::error::MessageError;
use pm2p::message::{Message, parse_log};
use std::io::Write;
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "messages.txt";

/// Append-only flat text log: each record is a wire form followed by a
/// blank line.
pub struct LogBackend {
    path: PathBuf,
}

impl LogBackend {
    /// Use `messages.txt` inside `state_dir`. The file is created on first append.
    pub fn open(state_dir: &Path) -> Self {
        Self::at(state_dir.join(LOG_FILE))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreBackend for LogBackend {
    fn load(&mut self) -> Result<Vec<Result<Message, MessageError>>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        Ok(parse_log(&data))
    }

    fn append(&mut self, message: &Message) -> Result<()> {
        let record = format!("{}\n\n", message.wire_form());
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(record.as_bytes())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm2p::message::Headers;

    fn make_msg(created: u64, body: &[&str]) -> Message {
        Message::new(
            created,
            Headers::from_sender("@a"),
            body.iter().map(|l| l.to_string()).collect(),
        )
        .unwrap()
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = LogBackend::open(dir.path());
        assert!(log.load().unwrap().is_empty());
        assert!(!log.path().exists());
    }

    #[test]
    fn append_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = LogBackend::open(dir.path());
        let a = make_msg(1, &["one"]);
        let b = make_msg(2, &["two", "", "with a gap"]);
        log.append(&a).unwrap();
        log.append(&b).unwrap();

        let data = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(data, format!("{}\n\n{}\n\n", a.wire_form(), b.wire_form()));

        let loaded: Vec<Message> = LogBackend::open(dir.path())
            .load()
            .unwrap()
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(loaded, vec![a, b]);
    }

    #[test]
    fn reads_log_written_by_hand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("messages.txt");
        std::fs::write(
            &path,
            "Message-uid: SHA-256 5103d1029e1c05d5e0a72833fbe6ed727266f1f333a64c3af2243ae6c1918b65\n\
             Created: 1672766344\n\
             From: @m1younis\n\
             Topic: #testing\n\
             Contents: 6\n\
             This\nis\na\nmessage\nfor\ntesting!\n\n",
        )
        .unwrap();
        let records = LogBackend::at(path).load().unwrap();
        assert_eq!(records.len(), 1);
        let msg = records[0].as_ref().unwrap();
        assert_eq!(msg.sender(), "@m1younis");
        assert_eq!(msg.contents().len(), 6);
    }
}
