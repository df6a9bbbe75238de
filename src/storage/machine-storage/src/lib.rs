//! # Machine Storage
//!
//! Storage abstraction layer for Machine plugin backends.
//!
//! Provides the [`StorageBackend`] trait and the common types every backend
//! shares. The plugin runtime serializes values and namespaces keys before
//! they reach a backend, so backends only ever see raw bytes under opaque
//! string keys.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod settings;

pub use backend::{expires_in, validate_key, StorageBackend};
pub use error::StorageError;
pub use settings::Settings;
