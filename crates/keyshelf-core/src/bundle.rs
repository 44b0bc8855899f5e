//! Bundles, their members and each member's shared-with-me index.
//!
//! Storage layout:
//!
//! ```text
//! bundles/{owner}/bundles/{id}     Bundle record (JSON)
//! bundles/{entity}/sharedWithMe    map bundle id -> SharedBundle (JSON)
//! ```
//!
//! The shared index is a denormalized copy of membership kept in step with
//! the bundle record by [`crate::access::BundleAccessManager`]. This module
//! only reads and writes the records; it takes no locks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use keyshelf_storage::StorageBackend;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use tracing::{info, warn};

use crate::error::BundleError;

const BUNDLE_SCHEMA: &str = "bundles";

/// One access verb. Variant order is the canonical rendering order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    Create,
    Read,
    Update,
    Patch,
    Delete,
    List,
}

impl Capability {
    pub const ALL: [Self; 6] = [
        Self::Create,
        Self::Read,
        Self::Update,
        Self::Patch,
        Self::Delete,
        Self::List,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::List => "list",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| BundleError::InvalidRequest {
                reason: format!("unknown capability '{s}'"),
            })
    }
}

/// A non-empty set of capabilities.
///
/// Serialized as a comma-joined string in canonical order, e.g.
/// `"create,read,list"`. Deserialization also accepts a JSON array of verbs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capabilities(BTreeSet<Capability>);

impl Capabilities {
    /// Build from an iterator of verbs.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::InvalidRequest`] if the set is empty.
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Result<Self, BundleError> {
        let set: BTreeSet<_> = caps.into_iter().collect();
        if set.is_empty() {
            return Err(BundleError::InvalidRequest {
                reason: "capabilities must not be empty".to_owned(),
            });
        }
        Ok(Self(set))
    }

    #[must_use]
    pub fn contains(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    /// Verbs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for cap in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            f.write_str(cap.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for Capabilities {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = s
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(Capability::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(caps)
    }
}

impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct CapsVisitor;

        impl<'de> Visitor<'de> for CapsVisitor {
            type Value = Capabilities;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a comma-separated capability string or an array of verbs")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Capabilities, E> {
                v.parse().map_err(E::custom)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Capabilities, A::Error> {
                let mut caps = Vec::new();
                while let Some(verb) = seq.next_element::<String>()? {
                    caps.push(verb.trim().parse().map_err(de::Error::custom)?);
                }
                Capabilities::new(caps).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_any(CapsVisitor)
    }
}

/// A member of a bundle other than its owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMember {
    pub entity_id: String,
    pub entity_name: String,
    pub is_admin: bool,
    /// When this grant was first made (Unix seconds). Survives edits.
    pub shared_timestamp: i64,
    pub capabilities: Capabilities,
}

/// A bundle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub id: String,
    /// Where the bundle's secret data lives, e.g. `bundles/data/{owner}/{id}`.
    pub path: String,
    /// Unix seconds; list order.
    pub created: i64,
    pub owner_entity_id: String,
    #[serde(default)]
    pub users: Vec<BundleMember>,
    /// Set while a membership update is in flight.
    #[serde(default)]
    pub wal_entry: bool,
}

impl Bundle {
    /// Storage key of this bundle's record.
    #[must_use]
    pub fn record_path(&self) -> String {
        record_path(&self.owner_entity_id, &self.id)
    }

    /// The member entry for `entity_id`, if any.
    #[must_use]
    pub fn member(&self, entity_id: &str) -> Option<&BundleMember> {
        self.users.iter().find(|m| m.entity_id == entity_id)
    }

    /// Whether `entity_id` may change membership: the owner, or a member
    /// flagged admin.
    #[must_use]
    pub fn can_administer(&self, entity_id: &str) -> bool {
        entity_id == self.owner_entity_id || self.member(entity_id).is_some_and(|m| m.is_admin)
    }
}

/// A bundle as seen from a member's shared-with-me index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedBundle {
    pub id: String,
    pub path: String,
    pub owner_entity_id: String,
    /// When this entry was last written (Unix seconds).
    pub created: i64,
    pub has_accepted: bool,
    pub is_admin: bool,
    pub capabilities: Capabilities,
}

impl SharedBundle {
    /// A fresh, not yet accepted entry for `member` of `bundle`.
    #[must_use]
    pub fn for_member(bundle: &Bundle, member: &BundleMember, now: i64) -> Self {
        Self {
            id: bundle.id.clone(),
            path: bundle.path.clone(),
            owner_entity_id: bundle.owner_entity_id.clone(),
            created: now,
            has_accepted: false,
            is_admin: member.is_admin,
            capabilities: member.capabilities.clone(),
        }
    }
}

/// A member's shared-with-me index, keyed by bundle id.
pub type SharedIndex = BTreeMap<String, SharedBundle>;

/// Storage key of a bundle record.
#[must_use]
pub fn record_path(owner_entity_id: &str, bundle_id: &str) -> String {
    format!("{BUNDLE_SCHEMA}/{owner_entity_id}/bundles/{bundle_id}")
}

/// Storage key of an entity's shared-with-me index.
#[must_use]
pub fn shared_index_path(entity_id: &str) -> String {
    format!("{BUNDLE_SCHEMA}/{entity_id}/sharedWithMe")
}

/// Storage location of a bundle's secret data.
#[must_use]
pub fn data_path(owner_entity_id: &str, bundle_id: &str) -> String {
    format!("{BUNDLE_SCHEMA}/data/{owner_entity_id}/{bundle_id}")
}

/// Bundle and shared-index persistence.
#[derive(Clone)]
pub struct BundleStore {
    storage: Arc<dyn StorageBackend>,
}

impl fmt::Debug for BundleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleStore").finish_non_exhaustive()
    }
}

impl BundleStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Create an empty bundle owned by `owner_entity_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::InvalidRequest`] for an unusable owner id and
    /// [`BundleError::Storage`] if the write fails.
    pub async fn create(&self, owner_entity_id: &str) -> Result<Bundle, BundleError> {
        if owner_entity_id.trim().is_empty() || owner_entity_id.contains('/') {
            return Err(BundleError::InvalidRequest {
                reason: "owner entity id must be non-empty and must not contain '/'".to_owned(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let bundle = Bundle {
            path: data_path(owner_entity_id, &id),
            id,
            created: chrono::Utc::now().timestamp(),
            owner_entity_id: owner_entity_id.to_owned(),
            users: Vec::new(),
            wal_entry: false,
        };
        self.put(&bundle).await?;

        info!(owner = %owner_entity_id, bundle_id = %bundle.id, "bundle created");
        Ok(bundle)
    }

    /// Read the bundle stored at `record_path`.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] or [`BundleError::Serialization`].
    pub async fn get(&self, record_path: &str) -> Result<Option<Bundle>, BundleError> {
        read_json(self.storage.as_ref(), record_path).await
    }

    /// Persist `bundle` at its record path.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] or [`BundleError::Serialization`].
    pub async fn put(&self, bundle: &Bundle) -> Result<(), BundleError> {
        write_json(self.storage.as_ref(), &bundle.record_path(), bundle).await
    }

    /// Remove the bundle record.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] if the delete fails.
    pub async fn delete(&self, bundle: &Bundle) -> Result<(), BundleError> {
        self.storage.delete(&bundle.record_path()).await?;
        Ok(())
    }

    /// Bundles owned by `owner_entity_id`, oldest first.
    ///
    /// A listed key whose record has vanished is skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] or [`BundleError::Serialization`].
    pub async fn list(&self, owner_entity_id: &str) -> Result<Vec<Bundle>, BundleError> {
        let prefix = format!("{BUNDLE_SCHEMA}/{owner_entity_id}/bundles/");
        let keys = self.storage.list(&prefix).await?;

        let mut bundles = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get(&key).await? {
                Some(bundle) => bundles.push(bundle),
                None => warn!(path = %key, "listed bundle record is missing, skipping"),
            }
        }
        bundles.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(bundles)
    }

    /// Read `entity_id`'s shared index. Missing means empty.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] or [`BundleError::Serialization`].
    pub async fn shared_index(&self, entity_id: &str) -> Result<SharedIndex, BundleError> {
        Ok(read_json(self.storage.as_ref(), &shared_index_path(entity_id))
            .await?
            .unwrap_or_default())
    }

    /// Replace `entity_id`'s shared index. An empty index removes the key.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] or [`BundleError::Serialization`].
    pub async fn put_shared_index(
        &self,
        entity_id: &str,
        index: &SharedIndex,
    ) -> Result<(), BundleError> {
        let path = shared_index_path(entity_id);
        if index.is_empty() {
            self.storage.delete(&path).await?;
            return Ok(());
        }
        write_json(self.storage.as_ref(), &path, index).await
    }

    /// Bundles shared with `entity_id`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Storage`] or [`BundleError::Serialization`].
    pub async fn list_shared(&self, entity_id: &str) -> Result<Vec<SharedBundle>, BundleError> {
        let mut shared: Vec<_> = self.shared_index(entity_id).await?.into_values().collect();
        shared.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        Ok(shared)
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(
    storage: &dyn StorageBackend,
    key: &str,
) -> Result<Option<T>, BundleError> {
    let Some(bytes) = storage.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| BundleError::Serialization {
            reason: format!("{key}: {e}"),
        })
}

async fn write_json<T: Serialize>(
    storage: &dyn StorageBackend,
    key: &str,
    value: &T,
) -> Result<(), BundleError> {
    let bytes = serde_json::to_vec(value).map_err(|e| BundleError::Serialization {
        reason: format!("{key}: {e}"),
    })?;
    storage.put(key, &bytes).await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use keyshelf_storage::MemoryBackend;

    use super::*;

    fn store() -> (BundleStore, MemoryBackend) {
        let backend = MemoryBackend::new();
        (BundleStore::new(Arc::new(backend.clone())), backend)
    }

    fn caps(s: &str) -> Capabilities {
        s.parse().unwrap()
    }

    #[test]
    fn capabilities_render_in_canonical_order() {
        assert_eq!(caps("list,read").to_string(), "read,list");
        assert_eq!(
            caps("delete, patch,update,read,create,list").to_string(),
            "create,read,update,patch,delete,list"
        );
        assert_eq!(caps("read,read").to_string(), "read");
    }

    #[test]
    fn capabilities_reject_unknown_and_empty() {
        assert!("read,sudo".parse::<Capabilities>().is_err());
        assert!("".parse::<Capabilities>().is_err());
        assert!(" , ".parse::<Capabilities>().is_err());
    }

    #[test]
    fn capabilities_serde_accepts_string_and_array() {
        let json = serde_json::to_string(&caps("list,read")).unwrap();
        assert_eq!(json, "\"read,list\"");

        let from_array: Capabilities = serde_json::from_str(r#"["list","read"]"#).unwrap();
        assert_eq!(from_array, caps("read,list"));
        assert!(serde_json::from_str::<Capabilities>(r#"[]"#).is_err());
        assert!(serde_json::from_str::<Capabilities>(r#""write""#).is_err());
    }

    #[test]
    fn owner_and_admins_can_administer() {
        let bundle = Bundle {
            id: "b".into(),
            path: data_path("o", "b"),
            created: 0,
            owner_entity_id: "o".into(),
            users: vec![
                BundleMember {
                    entity_id: "a".into(),
                    entity_name: "alice".into(),
                    is_admin: true,
                    shared_timestamp: 1,
                    capabilities: caps("read"),
                },
                BundleMember {
                    entity_id: "r".into(),
                    entity_name: "rob".into(),
                    is_admin: false,
                    shared_timestamp: 1,
                    capabilities: caps("read"),
                },
            ],
            wal_entry: false,
        };
        assert!(bundle.can_administer("o"));
        assert!(bundle.can_administer("a"));
        assert!(!bundle.can_administer("r"));
        assert!(!bundle.can_administer("stranger"));
    }

    #[tokio::test]
    async fn create_persists_empty_bundle() {
        let (store, _) = store();
        let bundle = store.create("owner-1").await.unwrap();
        assert_eq!(bundle.owner_entity_id, "owner-1");
        assert!(bundle.users.is_empty());
        assert!(!bundle.wal_entry);
        assert_eq!(bundle.path, format!("bundles/data/owner-1/{}", bundle.id));

        let loaded = store.get(&bundle.record_path()).await.unwrap().unwrap();
        assert_eq!(loaded, bundle);
    }

    #[tokio::test]
    async fn list_is_sorted_by_created_and_stable() {
        let (store, _) = store();
        for created in [30, 10, 20] {
            let mut bundle = store.create("o").await.unwrap();
            bundle.created = created;
            store.put(&bundle).await.unwrap();
        }
        store.create("someone-else").await.unwrap();

        let first = store.list("o").await.unwrap();
        let created: Vec<_> = first.iter().map(|b| b.created).collect();
        assert_eq!(created, vec![10, 20, 30]);
        assert_eq!(store.list("o").await.unwrap(), first);
    }

    /// Lists one extra key that has no value behind it.
    struct DanglingBackend {
        inner: MemoryBackend,
        phantom: String,
    }

    #[async_trait::async_trait]
    impl StorageBackend for DanglingBackend {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, keyshelf_storage::StorageError> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, value: &[u8]) -> Result<(), keyshelf_storage::StorageError> {
            self.inner.put(key, value).await
        }
        async fn delete(&self, key: &str) -> Result<(), keyshelf_storage::StorageError> {
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>, keyshelf_storage::StorageError> {
            let mut keys = self.inner.list(prefix).await?;
            if self.phantom.starts_with(prefix) {
                keys.push(self.phantom.clone());
            }
            Ok(keys)
        }
    }

    #[tokio::test]
    async fn list_skips_dangling_entries() {
        let store = BundleStore::new(Arc::new(DanglingBackend {
            inner: MemoryBackend::new(),
            phantom: record_path("o", "vanished"),
        }));
        let kept = store.create("o").await.unwrap();

        let listed = store.list("o").await.unwrap();
        assert_eq!(listed, vec![kept]);
    }

    #[tokio::test]
    async fn corrupt_record_is_serialization_error() {
        let (store, backend) = store();
        backend
            .put(&record_path("o", "broken"), b"not json")
            .await
            .unwrap();
        assert!(matches!(
            store.get(&record_path("o", "broken")).await,
            Err(BundleError::Serialization { .. })
        ));
    }

    #[tokio::test]
    async fn shared_index_roundtrip_and_empty_removal() {
        let (store, backend) = store();
        assert!(store.shared_index("alice").await.unwrap().is_empty());

        let bundle = store.create("o").await.unwrap();
        let member = BundleMember {
            entity_id: "alice".into(),
            entity_name: "alice".into(),
            is_admin: false,
            shared_timestamp: 5,
            capabilities: caps("read,list"),
        };
        let mut index = SharedIndex::new();
        index.insert(bundle.id.clone(), SharedBundle::for_member(&bundle, &member, 7));
        store.put_shared_index("alice", &index).await.unwrap();

        let shared = store.list_shared("alice").await.unwrap();
        assert_eq!(shared.len(), 1);
        assert!(!shared[0].has_accepted);
        assert_eq!(shared[0].capabilities.to_string(), "read,list");

        store.put_shared_index("alice", &SharedIndex::new()).await.unwrap();
        assert!(!backend.exists(&shared_index_path("alice")).await.unwrap());
    }
}
