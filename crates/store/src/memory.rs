//! In-process [`CacheStore`] with TTL expiry and owner-tagged locks.
//!
//! Expiry is measured on the tokio clock so paused-time tests can advance it.
//! A lock is released only by the handle that took it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use protocol::{CacheLock, CacheStore, StoreError};
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

struct Entry {
    value: Value,
    expires_at: Instant,
}

struct Hold {
    owner: Uuid,
    expires_at: Instant,
}

#[derive(Default)]
struct Shared {
    values: Mutex<HashMap<String, Entry>>,
    locks: Mutex<HashMap<String, Hold>>,
}

/// TTL-bounded in-memory cache that also hands out locks.
///
/// Clones share the same storage.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) values.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.shared
            .values
            .lock()
            .values()
            .filter(|entry| entry.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops expired values and lock holds.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.shared.values.lock().retain(|_, entry| entry.expires_at > now);
        self.shared.locks.lock().retain(|_, hold| hold.expires_at > now);
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("values", &self.shared.values.lock().len())
            .field("locks", &self.shared.locks.lock().len())
            .finish()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let mut values = self.shared.values.lock();
        match values.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now() + ttl;
        self.shared
            .values
            .lock()
            .insert(key.to_owned(), Entry { value, expires_at });
        tracing::trace!(key, ttl_secs = ttl.as_secs(), "cached value");
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<(), StoreError> {
        self.shared.values.lock().remove(key);
        Ok(())
    }

    fn lock(&self, key: &str, ttl: Duration) -> Arc<dyn CacheLock> {
        Arc::new(MemoryLock {
            key: key.to_owned(),
            ttl,
            owner: Uuid::new_v4(),
            shared: Arc::clone(&self.shared),
        })
    }
}

/// A lock handle issued by [`MemoryStore::lock`].
///
/// Each handle carries its own owner token; only that token can release the
/// hold it acquired.
pub struct MemoryLock {
    key: String,
    ttl: Duration,
    owner: Uuid,
    shared: Arc<Shared>,
}

#[async_trait]
impl CacheLock for MemoryLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn try_acquire(&self) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut locks = self.shared.locks.lock();
        if let Some(hold) = locks.get(&self.key) {
            if hold.expires_at > now && hold.owner != self.owner {
                return Ok(false);
            }
            if hold.owner != self.owner {
                tracing::debug!(key = %self.key, "taking over expired lock");
            }
        }
        locks.insert(
            self.key.clone(),
            Hold {
                owner: self.owner,
                expires_at: now + self.ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self) -> Result<(), StoreError> {
        let mut locks = self.shared.locks.lock();
        if locks.get(&self.key).is_some_and(|hold| hold.owner == self.owner) {
            locks.remove(&self.key);
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLock")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish()
    }
}
