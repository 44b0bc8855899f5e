//! In-memory storage backend.
//!
//! Stores all data in a `BTreeMap` behind a `RwLock`. Nothing is persisted;
//! all data is lost when the process exits. Used by unit tests and by the
//! server's `memory` storage mode.
//!
//! The backend can also be told to fail writes under a key prefix, which lets
//! tests exercise partial-failure paths of multi-key updates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::{StorageBackend, StorageError};

/// An in-memory storage backend backed by a `BTreeMap`.
///
/// Cloning shares the underlying map. Keys are kept sorted, so prefix
/// listing is a `BTreeMap::range` scan.
///
/// # Examples
///
/// ```
/// # use keyshelf_storage::{MemoryBackend, StorageBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// backend.put("users/entity/abc", b"{}").await.unwrap();
/// let val = backend.get("users/entity/abc").await.unwrap();
/// assert_eq!(val, Some(b"{}".to_vec()));
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    failing_prefixes: Arc<RwLock<BTreeSet<String>>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` and `delete` on a key starting with
    /// `prefix` fail with a storage error.
    pub async fn fail_writes_under(&self, prefix: &str) {
        self.failing_prefixes.write().await.insert(prefix.to_owned());
    }

    /// Undo every [`fail_writes_under`](Self::fail_writes_under) call.
    pub async fn clear_write_failures(&self) {
        self.failing_prefixes.write().await.clear();
    }

    async fn write_blocked(&self, key: &str) -> bool {
        let blocked = self
            .failing_prefixes
            .read()
            .await
            .iter()
            .any(|p| key.starts_with(p.as_str()));
        if blocked {
            debug!(key = %key, "failing write by request");
        }
        blocked
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        if self.write_blocked(key).await {
            return Err(StorageError::Write {
                key: key.to_owned(),
                reason: "injected write failure".to_owned(),
            });
        }
        let mut data = self.data.write().await;
        data.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.write_blocked(key).await {
            return Err(StorageError::Delete {
                key: key.to_owned(),
                reason: "injected delete failure".to_owned(),
            });
        }
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        let keys = data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let data = self.data.read().await;
        Ok(data.contains_key(key))
    }
}
