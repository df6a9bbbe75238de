//! Storage backend trait definition.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::settings::Settings;

/// Storage backend trait for implementing different storage engines.
///
/// A backend is constructed with its [`Settings`], initialized once with
/// [`init`](StorageBackend::init), used for any number of operations and
/// finally closed with [`close`](StorageBackend::close).
///
/// Keys arrive already namespaced and values already serialized. Backends
/// never interpret either.
///
/// Concurrent operations on the same key may interleave unless a backend
/// documents its own locking.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Returns the settings this backend was constructed with.
    fn settings(&self) -> &Settings;

    /// One-time asynchronous setup after construction.
    ///
    /// The default does nothing.
    async fn init(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Get a value by key.
    ///
    /// Returns `Ok(None)` when the key was never set, was deleted or has
    /// expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a value under a key, replacing any previous value.
    ///
    /// With `expires`, the value is treated as absent once that many seconds
    /// have elapsed. Without it, the value persists until deleted.
    async fn set(&self, key: &str, value: &[u8], expires: Option<u64>)
        -> Result<(), StorageError>;

    /// Delete a value by key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Check if a key currently holds a live value.
    async fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }

    /// Total size of the retained data in bytes.
    async fn size(&self) -> Result<u64, StorageError>;

    /// Release every resource held by the backend.
    async fn close(&self) -> Result<(), StorageError>;
}

/// Validates that a key is usable by a backend.
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() {
        return Err(StorageError::InvalidInput("key cannot be empty".into()));
    }
    Ok(())
}

/// Converts an optional expiration in seconds into a time-to-live.
///
/// # Errors
///
/// Returns [`StorageError::InvalidInput`] for `Some(0)`.
pub fn expires_in(expires: Option<u64>) -> Result<Option<Duration>, StorageError> {
    match expires {
        None => Ok(None),
        Some(0) => Err(StorageError::InvalidInput(
            "expires must be a positive number of seconds".into(),
        )),
        Some(secs) => Ok(Some(Duration::from_secs(secs))),
    }
}
