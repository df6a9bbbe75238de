//! # Machine Storage - Memory Backend
//!
//! In-memory implementation of the storage backend.
//!
//! Data lives only as long as the process. Expired entries are evicted lazily
//! when read, and purged in bulk whenever the size is computed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info};

use machine_storage::{expires_in, validate_key, Settings, StorageBackend, StorageError};

/// A stored value and its optional deadline.
#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    closed: bool,
}

impl State {
    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }
}

/// In-memory storage backend.
///
/// Operations on the same key are serialized by a single lock, so a `get`
/// never observes a partially written value.
#[derive(Debug)]
pub struct MemoryBackend {
    settings: Settings,
    state: RwLock<State>,
}

impl MemoryBackend {
    /// Creates an empty backend. The memory backend reads no settings.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            state: RwLock::new(State::default()),
        }
    }

    /// Number of entries currently held, including expired ones not yet
    /// evicted.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    /// Returns true if no entries are held.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Removes every expired entry and returns how many were dropped.
    pub async fn purge_expired(&self) -> Result<usize, StorageError> {
        let mut state = self.state.write().await;
        state.ensure_open()?;

        let purged = state.purge_expired(Instant::now());
        if purged > 0 {
            debug!(purged, "Purged expired entries");
        }
        Ok(purged)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn settings(&self) -> &Settings {
        &self.settings
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        let now = Instant::now();

        {
            let state = self.state.read().await;
            state.ensure_open()?;
            match state.entries.get(key) {
                None => return Ok(None),
                Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
                Some(_) => {}
            }
        }

        // Expired: evict unless a concurrent `set` replaced it meanwhile.
        let mut state = self.state.write().await;
        state.ensure_open()?;
        match state.entries.get(key).map(|entry| entry.is_expired(now)) {
            Some(true) => {
                state.entries.remove(key);
                debug!(key = %key, "Evicted expired entry");
                Ok(None)
            }
            Some(false) => Ok(state.entries.get(key).map(|entry| entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        expires: Option<u64>,
    ) -> Result<(), StorageError> {
        validate_key(key)?;
        let ttl = expires_in(expires)?;

        let mut state = self.state.write().await;
        state.ensure_open()?;

        // A deadline past what the clock can represent never arrives.
        let entry = Entry {
            value: value.to_vec(),
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        state.entries.insert(key.to_string(), entry);

        debug!(key = %key, len = value.len(), expires = ?expires, "Stored entry");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;

        let mut state = self.state.write().await;
        state.ensure_open()?;

        if state.entries.remove(key).is_some() {
            debug!(key = %key, "Deleted entry");
        }
        Ok(())
    }

    async fn has(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;

        let state = self.state.read().await;
        state.ensure_open()?;

        let now = Instant::now();
        Ok(state
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn size(&self) -> Result<u64, StorageError> {
        let mut state = self.state.write().await;
        state.ensure_open()?;

        state.purge_expired(Instant::now());
        Ok(state
            .entries
            .iter()
            .map(|(key, entry)| (key.len() + entry.value.len()) as u64)
            .sum())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().await;
        if state.closed {
            return Ok(());
        }

        let dropped = state.entries.len();
        state.entries = HashMap::new();
        state.closed = true;

        info!(dropped, "Memory backend closed");
        Ok(())
    }
}
