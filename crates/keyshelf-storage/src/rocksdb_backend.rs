//! `RocksDB` storage backend.
//!
//! Keys are routed by their first path segment into one column family per
//! keyshelf namespace:
//!
//! ```text
//! users/...     users      registry records and the name index
//! bundles/...   bundles    bundle records, shared indexes, policy status
//! sys/...       sys        locally stored policy text
//! anything else default
//! ```
//!
//! Keys are stored whole inside their family, so `list` returns the same
//! strings `put` was given. Listing seeks straight to the prefix with a
//! bounded iterator instead of scanning forward from it.
//!
//! Writes are synced to the `RocksDB` log before returning. The bundle
//! protocol persists its `wal_entry` marker and then fans out to other keys;
//! a marker that only reached the OS page cache could vanish on power loss
//! while the writes after it survive.
//!
//! `RocksDB` is synchronous, so every call runs on the Tokio blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, DEFAULT_COLUMN_FAMILY_NAME,
    IteratorMode, MultiThreaded, Options, PrefixRange, ReadOptions, WriteOptions,
};
use tracing::warn;

use crate::{StorageBackend, StorageError};

type Db = DBWithThreadMode<MultiThreaded>;

/// Namespaces that get their own column family.
const NAMESPACES: [&str; 3] = ["users", "bundles", "sys"];

/// A storage backend backed by `RocksDB`.
///
/// Cheap to clone; clones share the same database handle.
///
/// # Examples
///
/// ```no_run
/// # use keyshelf_storage::RocksDbBackend;
/// let backend = RocksDbBackend::open("/var/lib/keyshelf/data").unwrap();
/// ```
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<Db>,
    path: PathBuf,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    /// Open (or create) a database at `path` with every namespace family.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if `RocksDB` cannot open or create the
    /// database or one of its column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = NAMESPACES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()));
        let db = Db::open_cf_descriptors(&opts, path, families).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Filesystem path of this database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` on the blocking pool. A task that panics or is cancelled is
    /// reported through `on_abort`.
    async fn blocking<T, F>(
        &self,
        op: F,
        on_abort: impl FnOnce(String) -> StorageError + Send,
    ) -> Result<T, StorageError>
    where
        F: FnOnce(&Db) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        match tokio::task::spawn_blocking(move || op(&db)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "rocksdb task aborted");
                Err(on_abort(format!("blocking task failed: {e}")))
            }
        }
    }
}

/// Column family holding `key`.
fn family_name(key: &str) -> &'static str {
    let top = key.split('/').next().unwrap_or_default();
    NAMESPACES
        .iter()
        .copied()
        .find(|ns| *ns == top)
        .unwrap_or(DEFAULT_COLUMN_FAMILY_NAME)
}

/// Families that may hold keys starting with `prefix`. A prefix that ends
/// its first segment pins one family; a shorter one may span all of them.
fn families_for_prefix(prefix: &str) -> Vec<&'static str> {
    if prefix.contains('/') {
        vec![family_name(prefix)]
    } else {
        std::iter::once(DEFAULT_COLUMN_FAMILY_NAME)
            .chain(NAMESPACES)
            .collect()
    }
}

fn handle<'a>(db: &'a Db, name: &str) -> Result<Arc<BoundColumnFamily<'a>>, StorageError> {
    db.cf_handle(name)
        .ok_or_else(|| StorageError::MissingColumnFamily {
            name: name.to_owned(),
        })
}

fn synced() -> WriteOptions {
    let mut opts = WriteOptions::default();
    opts.set_sync(true);
    opts
}

#[async_trait::async_trait]
impl StorageBackend for RocksDbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let owned = key.to_owned();
        self.blocking(
            move |db| {
                let cf = handle(db, family_name(&owned))?;
                db.get_cf(&cf, owned.as_bytes())
                    .map_err(|e| StorageError::Read {
                        key: owned,
                        reason: e.to_string(),
                    })
            },
            |reason| StorageError::Read {
                key: key.to_owned(),
                reason,
            },
        )
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let owned = key.to_owned();
        let value = value.to_vec();
        self.blocking(
            move |db| {
                let cf = handle(db, family_name(&owned))?;
                db.put_cf_opt(&cf, owned.as_bytes(), &value, &synced())
                    .map_err(|e| StorageError::Write {
                        key: owned,
                        reason: e.to_string(),
                    })
            },
            |reason| StorageError::Write {
                key: key.to_owned(),
                reason,
            },
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let owned = key.to_owned();
        self.blocking(
            move |db| {
                let cf = handle(db, family_name(&owned))?;
                db.delete_cf_opt(&cf, owned.as_bytes(), &synced())
                    .map_err(|e| StorageError::Delete {
                        key: owned,
                        reason: e.to_string(),
                    })
            },
            |reason| StorageError::Delete {
                key: key.to_owned(),
                reason,
            },
        )
        .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let owned = prefix.to_owned();
        self.blocking(
            move |db| {
                let mut keys = Vec::new();
                for name in families_for_prefix(&owned) {
                    let cf = handle(db, name)?;
                    let mut read = ReadOptions::default();
                    read.set_iterate_range(PrefixRange(owned.as_bytes()));
                    for item in db.iterator_cf_opt(&cf, read, IteratorMode::Start) {
                        let (k, _) = item.map_err(|e| StorageError::List {
                            prefix: owned.clone(),
                            reason: e.to_string(),
                        })?;
                        let key = String::from_utf8(k.into_vec())
                            .map_err(|e| StorageError::InvalidKey {
                                reason: e.to_string(),
                            })?;
                        keys.push(key);
                    }
                }
                // Families are visited one after another.
                keys.sort_unstable();
                Ok(keys)
            },
            |reason| StorageError::List {
                prefix: prefix.to_owned(),
                reason,
            },
        )
        .await
    }
}
