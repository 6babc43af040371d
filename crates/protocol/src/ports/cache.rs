//! Cache and lock store contract.
//!
//! Every call may block on I/O and must be safe to issue from concurrent
//! tasks. Implementations keep all shared state inside the store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::errors::{ErrorCode, ForrstError};

/// Failures raised by a [`CacheStore`] or [`CacheLock`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached or refused the operation.
    #[error("Cache store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be (de)serialised.
    #[error("Cached value is corrupt: {0}")]
    Corrupt(String),
}

impl From<StoreError> for ForrstError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(message) => ForrstError::new(
                ErrorCode::Unavailable,
                format!("Cache store unavailable: {message}"),
            ),
            corrupt @ StoreError::Corrupt(_) => ForrstError::internal(corrupt),
        }
    }
}

/// A TTL-bounded key/value store that can also hand out locks.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the live value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Stores `value` under `key` for `ttl`.
    async fn put(&self, key: &str, value: Value, ttl: Duration) -> Result<(), StoreError>;

    /// Removes `key`. Removing a missing key is not an error.
    async fn forget(&self, key: &str) -> Result<(), StoreError>;

    /// Returns a handle for the lock named `key`. Creating the handle does not
    /// acquire anything.
    fn lock(&self, key: &str, ttl: Duration) -> Arc<dyn CacheLock>;
}

/// A mutual-exclusion lock bounded by a TTL.
///
/// - [`CacheLock::try_acquire`] never waits.
/// - A holder that crashes loses the lock once the TTL elapses.
/// - [`CacheLock::release`] is idempotent and never releases a lock held by a
///   different handle.
#[async_trait]
pub trait CacheLock: Send + Sync {
    /// The lock's key.
    fn key(&self) -> &str;

    /// Attempts to take the lock without waiting. Returns `false` when another
    /// holder owns it.
    async fn try_acquire(&self) -> Result<bool, StoreError>;

    /// Releases the lock if this handle holds it.
    async fn release(&self) -> Result<(), StoreError>;
}
