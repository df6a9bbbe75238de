//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
///
/// A missing or expired key is not an error: `get` reports it as `Ok(None)`
/// and `has` as `Ok(false)`.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not reach its store.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A query against the store failed.
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// A key or argument was rejected.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A setting is missing a usable value.
    #[error("invalid setting {key}: {reason}")]
    InvalidSettings {
        /// Setting name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },

    /// An operation was issued before `init` completed.
    #[error("storage backend not initialized")]
    NotInitialized,

    /// `init` was called more than once.
    #[error("storage backend already initialized")]
    AlreadyInitialized,

    /// An operation was issued after `close`.
    #[error("storage backend closed")]
    Closed,

    /// Generic I/O error.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}
