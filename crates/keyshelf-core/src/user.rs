//! Registry of user unlock keys.
//!
//! One [`UserEntry`] per entity under `users/entity/{entity_id}`, plus a
//! name index `users/name/{entity_name}` holding the entity id. Bundle
//! sharing resolves caller-supplied names through this index and never
//! trusts an id sent by a client.
//!
//! Registration is write-once: a second registration for the same entity is
//! rejected rather than overwriting the stored envelope.

use std::sync::Arc;

use keyshelf_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BundleError, UserError};
use crate::jwk::PublicJwk;
use crate::lock::KeyedLocks;
use crate::uuk::Uuk;

const ENTITY_PREFIX: &str = "users/entity/";
const NAME_PREFIX: &str = "users/name/";

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub entity_id: String,
    pub entity_name: String,
    pub uuk: Uuk,
    /// Unix seconds.
    pub registered: i64,
}

/// Reads and writes [`UserEntry`] records.
#[derive(Clone)]
pub struct UserStore {
    storage: Arc<dyn StorageBackend>,
    locks: KeyedLocks,
}

impl std::fmt::Debug for UserStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserStore").finish_non_exhaustive()
    }
}

impl UserStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            locks: KeyedLocks::new(None),
        }
    }

    /// Register `uuk` for `entity_id` under the display name `entity_name`.
    ///
    /// The name index is written before the entry, so a crash in between
    /// leaves a retryable state rather than an entity that cannot be found
    /// by name.
    ///
    /// # Errors
    ///
    /// - [`UserError::InvalidIdentity`] if the id or name is empty or contains `/`.
    /// - [`UserError::Invalid`] if the envelope fails validation.
    /// - [`UserError::AlreadyRegistered`] if the entity already has a UUK.
    /// - [`UserError::NameTaken`] if the name belongs to another entity.
    /// - [`UserError::Storage`] if the backend fails.
    pub async fn register(
        &self,
        entity_id: &str,
        entity_name: &str,
        uuk: Uuk,
    ) -> Result<UserEntry, UserError> {
        check_segment("entity_id", entity_id)?;
        check_segment("entity_name", entity_name)?;
        uuk.validate()?;

        let entity_key = entity_key(entity_id);
        let name_key = name_key(entity_name);
        let _entity_guard = self.locks.acquire(&entity_key).await.map_err(lock_error)?;
        let _name_guard = self.locks.acquire(&name_key).await.map_err(lock_error)?;

        if self.storage.exists(&entity_key).await? {
            return Err(UserError::AlreadyRegistered {
                entity_id: entity_id.to_owned(),
            });
        }
        if let Some(owner) = self.storage.get(&name_key).await? {
            if owner != entity_id.as_bytes() {
                return Err(UserError::NameTaken {
                    entity_name: entity_name.to_owned(),
                });
            }
        }

        let entry = UserEntry {
            entity_id: entity_id.to_owned(),
            entity_name: entity_name.to_owned(),
            uuk,
            registered: chrono::Utc::now().timestamp(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| UserError::Serialization {
            reason: e.to_string(),
        })?;

        self.storage.put(&name_key, entity_id.as_bytes()).await?;
        self.storage.put(&entity_key, &bytes).await?;

        info!(
            entity_id = %entity_id,
            entity_name = %entity_name,
            uuid = %entry.uuk.uuid,
            "unlock key registered"
        );
        Ok(entry)
    }

    /// Look up a registered user by entity id.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::NotFound`] if the entity is not registered.
    pub async fn get(&self, entity_id: &str) -> Result<UserEntry, UserError> {
        self.find(entity_id)
            .await?
            .ok_or_else(|| UserError::NotFound {
                entity_id: entity_id.to_owned(),
            })
    }

    /// Like [`get`](Self::get) but returns `None` for an unknown entity.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::Storage`] or [`UserError::Serialization`].
    pub async fn find(&self, entity_id: &str) -> Result<Option<UserEntry>, UserError> {
        let Some(bytes) = self.storage.get(&entity_key(entity_id)).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| UserError::Serialization {
                reason: e.to_string(),
            })
    }

    /// Resolve a display name to its canonical entity id.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::UnknownName`] if no entity registered the name.
    pub async fn resolve_entity_id(&self, entity_name: &str) -> Result<String, UserError> {
        let unknown = || UserError::UnknownName {
            entity_name: entity_name.to_owned(),
        };
        if check_segment("entity_name", entity_name).is_err() {
            return Err(unknown());
        }
        let bytes = self.storage.get(&name_key(entity_name)).await?.ok_or_else(unknown)?;
        String::from_utf8(bytes).map_err(|e| UserError::Serialization {
            reason: e.to_string(),
        })
    }

    /// The registered public key of `entity_id`.
    ///
    /// # Errors
    ///
    /// Returns [`UserError::NotFound`] if the entity is not registered.
    pub async fn public_key(&self, entity_id: &str) -> Result<PublicJwk, UserError> {
        Ok(self.get(entity_id).await?.uuk.pub_key)
    }
}

fn entity_key(entity_id: &str) -> String {
    format!("{ENTITY_PREFIX}{entity_id}")
}

fn name_key(entity_name: &str) -> String {
    format!("{NAME_PREFIX}{entity_name}")
}

fn check_segment(field: &str, value: &str) -> Result<(), UserError> {
    if value.trim().is_empty() || value.contains('/') {
        return Err(UserError::InvalidIdentity {
            reason: format!("{field} must be non-empty and must not contain '/'"),
        });
    }
    Ok(())
}

fn lock_error(err: BundleError) -> UserError {
    match err {
        BundleError::LockTimeout { path } => UserError::LockTimeout { path },
        other => UserError::InvalidIdentity {
            reason: other.to_string(),
        },
    }
}
