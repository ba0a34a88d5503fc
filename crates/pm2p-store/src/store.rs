use crate::backend::{MemoryBackend, StoreBackend};
use anyhow::{Context, Result, anyhow};
use pm2p::message::{Headers, Message};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard};

/// In-memory view of the store, in arrival order.
#[derive(Default)]
struct Index {
    order: Vec<Message>,
    by_hash: HashMap<String, usize>,
}

impl Index {
    /// Returns false if the hash is already present.
    fn insert(&mut self, message: Message) -> bool {
        if self.by_hash.contains_key(message.hash()) {
            return false;
        }
        self.by_hash
            .insert(message.hash().to_string(), self.order.len());
        self.order.push(message);
        true
    }
}

/// Hash-keyed, chronologically ordered message collection shared by every
/// session of a node.
///
/// Reads run concurrently against the in-memory index. Appends serialize on
/// the backend lock, persist the record, then publish it into the index, so
/// a reader sees either the state before or after a write.
pub struct MessageStore {
    index: RwLock<Index>,
    backend: Mutex<Box<dyn StoreBackend>>,
}

impl MessageStore {
    /// Replay the backend into memory. Malformed records are skipped.
    pub fn open(mut backend: Box<dyn StoreBackend>) -> Result<Self> {
        let records = backend.load().context("failed to load message store")?;
        let mut index = Index::default();
        let mut skipped = 0usize;
        for record in records {
            match record {
                Ok(msg) => {
                    let hash = msg.hash().to_string();
                    if !index.insert(msg) {
                        tracing::debug!(%hash, "duplicate stored message ignored");
                    }
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(err = %e, "skipping malformed stored message");
                }
            }
        }
        tracing::info!(
            count = index.order.len(),
            skipped,
            backend = %backend.describe(),
            "message store loaded"
        );
        Ok(Self {
            index: RwLock::new(index),
            backend: Mutex::new(backend),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            index: RwLock::new(Index::default()),
            backend: Mutex::new(Box::new(MemoryBackend::default())),
        }
    }

    /// Persist and publish a message. Returns false (and writes nothing) if
    /// a message with the same hash is already stored.
    pub fn append(&self, message: Message) -> Result<bool> {
        let mut backend = self
            .backend
            .lock()
            .map_err(|e| anyhow!("store backend lock poisoned: {e}"))?;
        if self.contains(message.hash()) {
            return Ok(false);
        }
        backend
            .append(&message)
            .with_context(|| format!("failed to persist message {}", message.hash()))?;
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        Ok(index.insert(message))
    }

    /// Author a message stamped with the current time and store it.
    pub fn compose(&self, headers: Headers, contents: Vec<String>) -> Result<Message> {
        let message = Message::compose(headers, contents)?;
        self.append(message.clone())?;
        tracing::info!(hash = %message.hash(), "message stored");
        Ok(message)
    }

    pub fn get(&self, hash: &str) -> Option<Message> {
        let index = self.read();
        index.by_hash.get(hash).map(|&i| index.order[i].clone())
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.read().by_hash.contains_key(hash)
    }

    /// Snapshot of every message in store order.
    pub fn messages(&self) -> Vec<Message> {
        self.read().order.clone()
    }

    pub fn hashes(&self) -> Vec<String> {
        self.read()
            .order
            .iter()
            .map(|m| m.hash().to_string())
            .collect()
    }

    /// Hashes, in store order, of messages created at or after `since` whose
    /// wire form contains `filter` (when given).
    pub fn filter_since(&self, since: u64, filter: Option<&str>) -> Vec<String> {
        self.read()
            .order
            .iter()
            .filter(|m| m.created() >= since)
            .filter(|m| filter.is_none_or(|f| m.wire_form().contains(f)))
            .map(|m| m.hash().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }
}
