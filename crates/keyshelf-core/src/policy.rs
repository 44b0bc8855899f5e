//! Access policy rendering and the policy-engine seam.
//!
//! Every entity with bundles shared to it gets one policy named
//! `{mount}/entity/{entity_name}`. The policy is rendered from the entity's
//! whole shared-with-me index: for each bundle, one statement for the data
//! path and one for the metadata path, both carrying that bundle's granted
//! capabilities.
//!
//! ```text
//! path "bundles/data/{owner}/{id}/*" {
//!     capabilities = ["read", "list"]
//! }
//!
//! path "bundles/metadata/{owner}/{id}/*" {
//!     capabilities = ["read", "list"]
//! }
//! ```
//!
//! Pushing the text is a side effect on an external engine behind
//! [`PolicyEngine`]. When a push keeps failing the entity's policy is marked
//! degraded in [`PolicyStatusStore`] until a later push succeeds.

use std::fmt::Write as _;
use std::sync::Arc;

use keyshelf_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bundle::SharedIndex;
use crate::error::PolicyError;

/// Storage prefix for policies written by [`StoragePolicyEngine`].
const POLICY_PREFIX: &str = "sys/policies/";

/// Marker that separates the mount from the bundle-relative path.
const DATA_MARKER: &str = "/data/";

/// Name of the policy that carries `entity_name`'s shared bundle grants.
#[must_use]
pub fn policy_name(mount: &str, entity_name: &str) -> String {
    format!("{mount}/entity/{entity_name}")
}

/// Split a bundle data path into `(mount, bundle-relative path)`.
///
/// `bundles/data/o/b` becomes `("bundles", "o/b")`.
///
/// # Errors
///
/// Returns [`PolicyError::InvalidPath`] unless the path contains the data
/// marker exactly once with non-empty text on both sides.
pub fn split_bundle_path(path: &str) -> Result<(&str, &str), PolicyError> {
    let invalid = || PolicyError::InvalidPath {
        path: path.to_owned(),
    };
    let (mount, rest) = path.split_once(DATA_MARKER).ok_or_else(invalid)?;
    if mount.is_empty() || rest.is_empty() || rest.contains(DATA_MARKER) {
        return Err(invalid());
    }
    Ok((mount, rest.trim_end_matches('/')))
}

/// Render the policy text for a shared index.
///
/// Bundles appear in bundle-id order so identical indexes render identical
/// text.
///
/// # Errors
///
/// Returns [`PolicyError::InvalidPath`] if any bundle path cannot be split.
pub fn render_policy(index: &SharedIndex) -> Result<String, PolicyError> {
    let mut out = String::new();
    for shared in index.values() {
        let (mount, rest) = split_bundle_path(&shared.path)?;
        let caps = shared
            .capabilities
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");

        for section in ["data", "metadata"] {
            if !out.is_empty() {
                out.push('\n');
            }
            // Writing to a String cannot fail.
            let _ = writeln!(
                out,
                "path \"{mount}/{section}/{rest}/*\" {{\n    capabilities = [{caps}]\n}}"
            );
        }
    }
    Ok(out)
}

/// The external engine that stores and enforces policy text.
#[async_trait::async_trait]
pub trait PolicyEngine: Send + Sync + 'static {
    /// Create or replace the policy `name`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Push`] if the engine rejects or cannot store the
    /// policy.
    async fn put_policy(&self, name: &str, rules: &str) -> Result<(), PolicyError>;

    /// Remove the policy `name`. Removing an absent policy succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Push`] if the engine fails.
    async fn delete_policy(&self, name: &str) -> Result<(), PolicyError>;
}

/// A [`PolicyEngine`] that keeps policies in the local storage backend under
/// `sys/policies/{name}`.
#[derive(Clone)]
pub struct StoragePolicyEngine {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for StoragePolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePolicyEngine").finish_non_exhaustive()
    }
}

impl StoragePolicyEngine {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Read back a stored policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Storage`] if the read fails.
    pub async fn get_policy(&self, name: &str) -> Result<Option<String>, PolicyError> {
        let Some(bytes) = self.storage.get(&format!("{POLICY_PREFIX}{name}")).await? else {
            return Ok(None);
        };
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| PolicyError::Push {
                name: name.to_owned(),
                reason: format!("stored policy is not UTF-8: {e}"),
            })
    }
}

#[async_trait::async_trait]
impl PolicyEngine for StoragePolicyEngine {
    async fn put_policy(&self, name: &str, rules: &str) -> Result<(), PolicyError> {
        self.storage
            .put(&format!("{POLICY_PREFIX}{name}"), rules.as_bytes())
            .await?;
        info!(name = %name, "policy written");
        Ok(())
    }

    async fn delete_policy(&self, name: &str) -> Result<(), PolicyError> {
        self.storage.delete(&format!("{POLICY_PREFIX}{name}")).await?;
        info!(name = %name, "policy deleted");
        Ok(())
    }
}

/// Recorded when an entity's policy could not be pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStatus {
    pub entity_id: String,
    pub policy_name: String,
    pub reason: String,
    /// Unix seconds of the failure.
    pub since: i64,
}

/// Degraded-policy markers under `bundles/{entity}/policyStatus`.
#[derive(Clone)]
pub struct PolicyStatusStore {
    storage: Arc<dyn StorageBackend>,
}

impl std::fmt::Debug for PolicyStatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStatusStore").finish_non_exhaustive()
    }
}

impl PolicyStatusStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    fn key(entity_id: &str) -> String {
        format!("bundles/{entity_id}/policyStatus")
    }

    /// The degraded marker for `entity_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Storage`] if the read fails, or
    /// [`PolicyError::Push`] if the marker is unreadable.
    pub async fn get(&self, entity_id: &str) -> Result<Option<PolicyStatus>, PolicyError> {
        let Some(bytes) = self.storage.get(&Self::key(entity_id)).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| PolicyError::Push {
                name: Self::key(entity_id),
                reason: format!("unreadable status marker: {e}"),
            })
    }

    /// Record a degraded policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Storage`] if the write fails.
    pub async fn mark_degraded(&self, status: &PolicyStatus) -> Result<(), PolicyError> {
        let bytes = serde_json::to_vec(status).map_err(|e| PolicyError::Push {
            name: status.policy_name.clone(),
            reason: format!("serialize status marker: {e}"),
        })?;
        self.storage.put(&Self::key(&status.entity_id), &bytes).await?;
        Ok(())
    }

    /// Clear the marker after a successful push.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Storage`] if the delete fails.
    pub async fn clear(&self, entity_id: &str) -> Result<(), PolicyError> {
        self.storage.delete(&Self::key(entity_id)).await?;
        Ok(())
    }
}
