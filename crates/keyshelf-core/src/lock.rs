//! Per-resource mutual exclusion.
//!
//! [`KeyedLocks`] hands out one async mutex per storage path. Operations on
//! the same path serialize; operations on different paths never contend on
//! anything but the brief map lookup. Entries are created on first use and
//! removed when the last guard or waiter for a path goes away, so the map
//! only holds paths that are currently in use.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::BundleError;

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// A map from resource path to an async mutex.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
    timeout: Option<Duration>,
}

impl fmt::Debug for KeyedLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedLocks")
            .field("active", &self.active())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl KeyedLocks {
    /// Create an empty lock map. `None` waits forever.
    #[must_use]
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            locks: Arc::default(),
            timeout,
        }
    }

    /// Acquire the lock for `path`, waiting at most the configured timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::LockTimeout`] if the lock is not acquired in
    /// time.
    pub async fn acquire(&self, path: &str) -> Result<PathGuard, BundleError> {
        let mutex = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(path.to_owned()).or_default())
        };

        let guard = match self.timeout {
            None => mutex.lock_owned().await,
            Some(limit) => {
                let attempt = tokio::time::timeout(limit, Arc::clone(&mutex).lock_owned()).await;
                // Our reference must be gone before pruning, or a holder that
                // released meanwhile leaves the entry behind for good.
                drop(mutex);
                match attempt {
                    Ok(guard) => guard,
                    Err(_) => {
                        prune(&self.locks, path);
                        return Err(BundleError::LockTimeout {
                            path: path.to_owned(),
                        });
                    }
                }
            }
        };

        Ok(PathGuard {
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
            path: path.to_owned(),
        })
    }

    /// Number of paths with a live guard or waiter.
    #[must_use]
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Holds the lock for one path until dropped.
pub struct PathGuard {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
    path: String,
}

impl PathGuard {
    /// The locked path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Debug for PathGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathGuard")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        // Release first: the guard keeps its own reference to the mutex.
        drop(self.guard.take());
        prune(&self.locks, &self.path);
    }
}

fn prune(locks: &LockMap, path: &str) {
    let mut map = locks.lock().unwrap_or_else(PoisonError::into_inner);
    if map.get(path).is_some_and(|m| Arc::strong_count(m) == 1) {
        map.remove(path);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn same_path_serializes() {
        let locks = KeyedLocks::new(None);
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                tokio::spawn(async move {
                    let _guard = locks.acquire("bundles/o/bundles/b1").await.unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn different_paths_do_not_block() {
        let locks = KeyedLocks::new(Some(Duration::from_millis(200)));
        let _a = locks.acquire("bundles/o/bundles/a").await.unwrap();
        let b = locks.acquire("bundles/o/bundles/b").await.unwrap();
        assert_eq!(b.path(), "bundles/o/bundles/b");
        assert_eq!(locks.active(), 2);
    }

    #[tokio::test]
    async fn entries_are_pruned_after_release() {
        let locks = KeyedLocks::new(None);
        {
            let _guard = locks.acquire("bundles/alice/sharedWithMe").await.unwrap();
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn waiter_keeps_entry_alive() {
        let locks = KeyedLocks::new(None);
        let first = locks.acquire("p").await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire("p").await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert!(locks.active() <= 1);
        waiter.await.unwrap();
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn acquisition_times_out() {
        let locks = KeyedLocks::new(Some(Duration::from_millis(20)));
        let _held = locks.acquire("bundles/o/bundles/b").await.unwrap();

        let err = locks.acquire("bundles/o/bundles/b").await.unwrap_err();
        assert!(matches!(err, BundleError::LockTimeout { ref path } if path == "bundles/o/bundles/b"));
        assert_eq!(locks.active(), 1);
    }

    #[tokio::test]
    async fn timed_out_waiter_leaves_no_entry_behind() {
        let locks = KeyedLocks::new(Some(Duration::from_millis(20)));
        let held = locks.acquire("bundles/o/bundles/b").await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("bundles/o/bundles/b").await })
        };
        // Release right around the waiter's deadline.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        let outcome = waiter.await.unwrap();
        if let Ok(guard) = outcome {
            drop(guard);
        }
        assert_eq!(locks.active(), 0);

        let again = locks.acquire("bundles/o/bundles/b").await.unwrap();
        assert_eq!(again.path(), "bundles/o/bundles/b");
    }
}
