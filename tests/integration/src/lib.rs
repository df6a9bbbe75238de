//! Conformance tests for Machine storage backends.
//!
//! Every check takes a freshly initialized backend and exercises it only
//! through the [`StorageBackend`] trait, so the same suite runs unchanged
//! against each backend in the workspace.

// Allow unwrap() in tests - panics are acceptable for test assertions
#![allow(clippy::disallowed_methods)]

use std::time::Duration;

use anyhow::{ensure, Result};
use machine_storage::{StorageBackend, StorageError};
use machine_storage_memory::MemoryBackend;
use machine_storage_sqlite::SqliteBackend;
use serde_json::json;
use tempfile::TempDir;

// ============================================================================
// Fixtures
// ============================================================================

/// A backend under test plus whatever must outlive it.
pub struct TestStore {
    pub backend: Box<dyn StorageBackend>,
    _data_dir: Option<TempDir>,
}

impl TestStore {
    /// In-memory backend.
    pub async fn memory() -> Result<Self> {
        let backend = MemoryBackend::default();
        backend.init().await?;
        Ok(Self {
            backend: Box::new(backend),
            _data_dir: None,
        })
    }

    /// SQLite backend on a file in a fresh temporary directory.
    pub async fn sqlite() -> Result<Self> {
        let data_dir = TempDir::new()?;
        let path = data_dir.path().join("machine-state.db");
        let settings = [("SQLITE_PATH", json!(path.to_string_lossy()))]
            .into_iter()
            .collect();

        let backend = SqliteBackend::new(settings)?;
        backend.init().await?;
        Ok(Self {
            backend: Box::new(backend),
            _data_dir: Some(data_dir),
        })
    }
}

// ============================================================================
// Checks
// ============================================================================

/// Keys never set, or deleted, are absent.
pub async fn check_absent_keys(backend: &dyn StorageBackend) -> Result<()> {
    ensure!(backend.get("never-set").await?.is_none());
    ensure!(!backend.has("never-set").await?);

    backend.set("a", b"1", None).await?;
    backend.delete("a").await?;
    ensure!(backend.get("a").await?.is_none(), "deleted key still readable");
    ensure!(!backend.has("a").await?, "deleted key still reported");
    Ok(())
}

/// Values without expiry read back exactly until overwritten or deleted.
pub async fn check_set_get_roundtrip(backend: &dyn StorageBackend) -> Result<()> {
    let binary: Vec<u8> = (0..=255).collect();

    backend.set("plugin.a:one", b"1", None).await?;
    backend.set("plugin.b:bin", &binary, None).await?;

    ensure!(backend.get("plugin.a:one").await? == Some(b"1".to_vec()));
    ensure!(backend.get("plugin.b:bin").await? == Some(binary));

    backend.set("plugin.a:one", b"2", None).await?;
    ensure!(backend.get("plugin.a:one").await? == Some(b"2".to_vec()));
    Ok(())
}

/// Expiring values read back immediately and vanish once the time elapses.
pub async fn check_expiry(backend: &dyn StorageBackend) -> Result<()> {
    backend.set("b", b"x", Some(1)).await?;
    backend.set("c", b"y", Some(3600)).await?;
    ensure!(backend.has("b").await?);
    ensure!(backend.get("b").await? == Some(b"x".to_vec()));

    tokio::time::sleep(Duration::from_millis(1100)).await;

    ensure!(!backend.has("b").await?, "expired key still reported");
    ensure!(backend.get("b").await?.is_none(), "expired key still readable");
    ensure!(backend.has("c").await?, "long-lived key expired early");
    Ok(())
}

/// The largest expiry is accepted and keeps the value readable.
pub async fn check_large_expiry(backend: &dyn StorageBackend) -> Result<()> {
    backend.set("far", b"future", Some(u64::MAX)).await?;
    ensure!(backend.has("far").await?, "far-future key reported absent");
    ensure!(backend.get("far").await? == Some(b"future".to_vec()));

    backend.delete("far").await?;
    ensure!(!backend.has("far").await?);
    Ok(())
}

/// Deleting twice, or deleting a never-set key, is not an error.
pub async fn check_delete_idempotent(backend: &dyn StorageBackend) -> Result<()> {
    backend.delete("ghost").await?;
    backend.set("k", b"v", None).await?;
    backend.delete("k").await?;
    backend.delete("k").await?;
    ensure!(!backend.has("k").await?);
    Ok(())
}

/// Size never shrinks on insert and returns to its baseline after deletes.
pub async fn check_size_accounting(backend: &dyn StorageBackend) -> Result<()> {
    let baseline = backend.size().await?;

    backend.set("size:a", b"0123456789", None).await?;
    let after_one = backend.size().await?;
    ensure!(after_one >= baseline, "insert decreased size");

    backend.set("size:b", b"0123456789", None).await?;
    let after_two = backend.size().await?;
    ensure!(after_two >= after_one, "insert decreased size");

    backend.delete("size:a").await?;
    backend.delete("size:b").await?;
    ensure!(
        backend.size().await? == baseline,
        "size inflated after deleting every key"
    );
    Ok(())
}

/// Invalid arguments surface as errors, distinct from absence.
pub async fn check_invalid_input(backend: &dyn StorageBackend) -> Result<()> {
    ensure!(matches!(
        backend.get("").await,
        Err(StorageError::InvalidInput(_))
    ));
    ensure!(matches!(
        backend.set("k", b"v", Some(0)).await,
        Err(StorageError::InvalidInput(_))
    ));
    Ok(())
}

/// Close is safe to repeat and later operations fail instead of answering.
pub async fn check_close(backend: &dyn StorageBackend) -> Result<()> {
    backend.set("k", b"v", None).await?;
    backend.close().await?;
    backend.close().await?;

    ensure!(matches!(backend.get("k").await, Err(StorageError::Closed)));
    ensure!(matches!(backend.has("k").await, Err(StorageError::Closed)));
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

macro_rules! conformance_tests {
    ($name:ident, $fixture:path) => {
        #[cfg(test)]
        mod $name {
            use super::*;

            async fn store() -> TestStore {
                $fixture().await.unwrap()
            }

            #[tokio::test]
            async fn test_absent_keys() {
                let store = store().await;
                check_absent_keys(store.backend.as_ref()).await.unwrap();
            }

            #[tokio::test]
            async fn test_set_get_roundtrip() {
                let store = store().await;
                check_set_get_roundtrip(store.backend.as_ref()).await.unwrap();
            }

            #[tokio::test]
            async fn test_expiry() {
                let store = store().await;
                check_expiry(store.backend.as_ref()).await.unwrap();
            }

            #[tokio::test]
            async fn test_large_expiry() {
                let store = store().await;
                check_large_expiry(store.backend.as_ref()).await.unwrap();
            }

            #[tokio::test]
            async fn test_delete_idempotent() {
                let store = store().await;
                check_delete_idempotent(store.backend.as_ref()).await.unwrap();
            }

            #[tokio::test]
            async fn test_size_accounting() {
                let store = store().await;
                check_size_accounting(store.backend.as_ref()).await.unwrap();
            }

            #[tokio::test]
            async fn test_invalid_input() {
                let store = store().await;
                check_invalid_input(store.backend.as_ref()).await.unwrap();
            }

            #[tokio::test]
            async fn test_close() {
                let store = store().await;
                check_close(store.backend.as_ref()).await.unwrap();
            }

            #[tokio::test]
            async fn test_scenario_set_get_delete() {
                let store = store().await;
                let backend = store.backend.as_ref();

                backend.set("a", b"1", None).await.unwrap();
                assert_eq!(backend.get("a").await.unwrap(), Some(b"1".to_vec()));

                backend.delete("a").await.unwrap();
                assert!(backend.get("a").await.unwrap().is_none());
                assert!(!backend.has("a").await.unwrap());

                backend.close().await.unwrap();
            }
        }
    };
}

conformance_tests!(memory, TestStore::memory);
conformance_tests!(sqlite, TestStore::sqlite);
