//! Shared application state.
//!
//! A single [`AppState`] is constructed at startup and shared across all
//! Axum handlers via `Arc`.

use std::sync::Arc;

use keyshelf_core::{AccessConfig, BundleAccessManager, BundleStore, PolicyEngine, PolicyStatusStore, UserStore};
use keyshelf_storage::StorageBackend;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// Registered unlock keys and the name index.
    pub users: UserStore,
    /// Bundle records and shared-with-me indexes.
    pub bundles: BundleStore,
    /// The sharing protocol.
    pub access: BundleAccessManager,
}

impl AppState {
    /// Build every subsystem on top of one storage backend.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        engine: Arc<dyn PolicyEngine>,
        config: AccessConfig,
    ) -> Self {
        let users = UserStore::new(Arc::clone(&storage));
        let bundles = BundleStore::new(Arc::clone(&storage));
        let access = BundleAccessManager::new(
            bundles.clone(),
            users.clone(),
            engine,
            PolicyStatusStore::new(storage),
            config,
        );
        Self {
            users,
            bundles,
            access,
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
