//! Bundle sharing protocol.
//!
//! [`BundleAccessManager`] changes who can reach a bundle. One membership
//! change touches several storage keys (the bundle record, every affected
//! member's shared-with-me index and every affected member's policy) and the
//! storage backend is only atomic per key. The bundle record's `wal_entry`
//! flag stands in for a transaction:
//!
//! 1. Names are resolved to entity ids and public keys. Any unknown or
//!    unregistered member aborts before anything is written.
//! 2. Under the bundle-path lock the requester is authorized, then
//!    `wal_entry = true` is persisted.
//! 3. Removed members lose their index entry; new and modified members get
//!    theirs upserted. Each member is updated under its own index-path lock
//!    and all members proceed concurrently. After each index write the
//!    member's policy is re-rendered and pushed.
//! 4. The new member list is written with `wal_entry = false`.
//!
//! A record found with `wal_entry` already set means a previous run stopped
//! somewhere inside step 3, so every member is treated as modified and
//! re-propagated.
//!
//! # Failure model
//!
//! Steps 1 and 2 fail the whole call. In step 3 a member's failure is
//! confined to that member and reported in [`MembershipUpdate::failures`]:
//!
//! - An index write failure leaves `wal_entry = true` on the final record so
//!   the next update repairs it. A removed member whose index could not be
//!   cleared stays on the member list so the removal is retried.
//! - A policy push that still fails after retries marks the member's policy
//!   degraded. The index is already durable; [`BundleAccessManager::resync_policy`]
//!   repairs the policy.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bundle::{
    Bundle, BundleMember, BundleStore, Capabilities, SharedBundle, SharedIndex, record_path,
    shared_index_path,
};
use crate::error::{BundleError, MemberFailure, MemberFailureKind, PolicyError, UserError};
use crate::jwk::PublicJwk;
use crate::lock::KeyedLocks;
use crate::policy::{PolicyEngine, PolicyStatus, PolicyStatusStore, policy_name, render_policy};
use crate::user::UserStore;

/// Tunables for [`BundleAccessManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessConfig {
    /// Mount name used in policy names, `{mount}/entity/{entity_name}`.
    pub mount: String,
    /// Extra attempts after a failed policy push.
    pub policy_push_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub policy_retry_backoff: Duration,
    /// Upper bound on waiting for a bundle or index lock. `None` waits forever.
    pub lock_timeout: Option<Duration>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            mount: "pwmanager".to_owned(),
            policy_push_retries: 3,
            policy_retry_backoff: Duration::from_millis(100),
            lock_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// One requested member of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub entity_name: String,
    #[serde(default)]
    pub is_admin: bool,
    pub capabilities: Capabilities,
}

/// The full desired member list of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdateRequest {
    pub users: Vec<MemberSpec>,
}

impl MemberUpdateRequest {
    /// Reject blank names and names listed twice.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::InvalidRequest`] describing the first problem.
    pub fn validate(&self) -> Result<(), BundleError> {
        let mut seen = HashSet::with_capacity(self.users.len());
        for spec in &self.users {
            let name = spec.entity_name.trim();
            if name.is_empty() {
                return Err(BundleError::InvalidRequest {
                    reason: "entity_name must not be empty".to_owned(),
                });
            }
            if !seen.insert(name) {
                return Err(BundleError::InvalidRequest {
                    reason: format!("member '{name}' is listed more than once"),
                });
            }
        }
        Ok(())
    }
}

/// Result of a membership change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MembershipUpdate {
    /// Public key of every member on the stored list, by entity id.
    pub public_keys: BTreeMap<String, PublicJwk>,
    /// Per-member problems that did not stop the update.
    pub failures: Vec<MemberFailure>,
}

/// What a member sub-update does to that member's index.
enum IndexChange<'a> {
    Upsert {
        bundle: &'a Bundle,
        member: &'a BundleMember,
    },
    Remove {
        bundle_id: &'a str,
    },
}

/// Runs the sharing protocol.
pub struct BundleAccessManager {
    bundles: BundleStore,
    users: UserStore,
    engine: Arc<dyn PolicyEngine>,
    statuses: PolicyStatusStore,
    locks: KeyedLocks,
    config: AccessConfig,
}

impl std::fmt::Debug for BundleAccessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleAccessManager")
            .field("locks", &self.locks)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BundleAccessManager {
    #[must_use]
    pub fn new(
        bundles: BundleStore,
        users: UserStore,
        engine: Arc<dyn PolicyEngine>,
        statuses: PolicyStatusStore,
        config: AccessConfig,
    ) -> Self {
        Self {
            locks: KeyedLocks::new(config.lock_timeout),
            bundles,
            users,
            engine,
            statuses,
            config,
        }
    }

    /// Replace the member list of bundle `bundle_id` owned by
    /// `owner_entity_id`.
    ///
    /// # Errors
    ///
    /// - [`BundleError::InvalidRequest`] for a malformed request or one that
    ///   lists the owner.
    /// - [`BundleError::Lookup`] if a named member is unknown or unregistered.
    /// - [`BundleError::NotFound`] if the bundle does not exist.
    /// - [`BundleError::NotAuthorized`] unless the requester is the owner or
    ///   an admin member. Nothing is written in this case.
    /// - [`BundleError::LockTimeout`] or [`BundleError::Storage`].
    pub async fn update_members(
        &self,
        owner_entity_id: &str,
        bundle_id: &str,
        requester_entity_id: &str,
        request: &MemberUpdateRequest,
    ) -> Result<MembershipUpdate, BundleError> {
        request.validate()?;

        let mut proposed = Vec::with_capacity(request.users.len());
        let mut keys = BTreeMap::new();
        for spec in &request.users {
            let entity_name = spec.entity_name.trim();
            let (entity_id, public_key) = self.lookup_member(entity_name).await?;
            if entity_id == owner_entity_id {
                return Err(BundleError::InvalidRequest {
                    reason: format!("'{entity_name}' owns the bundle and cannot be a member"),
                });
            }
            proposed.push(BundleMember {
                entity_id: entity_id.clone(),
                entity_name: entity_name.to_owned(),
                is_admin: spec.is_admin,
                shared_timestamp: 0,
                capabilities: spec.capabilities.clone(),
            });
            keys.insert(entity_id, public_key);
        }

        let path = record_path(owner_entity_id, bundle_id);
        let _bundle_guard = self.locks.acquire(&path).await?;

        let bundle = self.bundles.get(&path).await?.ok_or(BundleError::NotFound)?;
        if !bundle.can_administer(requester_entity_id) {
            warn!(
                bundle_id = %bundle_id,
                requester = %requester_entity_id,
                "membership update refused"
            );
            return Err(BundleError::NotAuthorized);
        }

        let (stored, failures) = self.commit(bundle, proposed).await?;

        let public_keys = stored
            .users
            .iter()
            .filter_map(|m| keys.remove_entry(&m.entity_id))
            .collect();
        info!(
            bundle_id = %bundle_id,
            requester = %requester_entity_id,
            members = stored.users.len(),
            failures = failures.len(),
            "bundle membership updated"
        );
        Ok(MembershipUpdate {
            public_keys,
            failures,
        })
    }

    /// Accept or decline a bundle shared with `entity_id`.
    ///
    /// Accepting sets `has_accepted` on the entity's index entry. Declining
    /// removes the entity from the bundle through the membership protocol.
    ///
    /// # Errors
    ///
    /// - [`BundleError::NotShared`] if the bundle is not in the entity's index.
    /// - [`BundleError::Incomplete`] if a decline could not clear the index.
    /// - [`BundleError::LockTimeout`] or [`BundleError::Storage`].
    pub async fn respond_to_share(
        &self,
        entity_id: &str,
        bundle_id: &str,
        accept: bool,
    ) -> Result<MembershipUpdate, BundleError> {
        let not_shared = || BundleError::NotShared {
            bundle_id: bundle_id.to_owned(),
        };

        if accept {
            let _guard = self.locks.acquire(&shared_index_path(entity_id)).await?;
            let mut index = self.bundles.shared_index(entity_id).await?;
            let entry = index.get_mut(bundle_id).ok_or_else(not_shared)?;
            entry.has_accepted = true;
            self.bundles.put_shared_index(entity_id, &index).await?;
            info!(entity_id = %entity_id, bundle_id = %bundle_id, "share accepted");
            return Ok(MembershipUpdate::default());
        }

        let owner = self
            .bundles
            .shared_index(entity_id)
            .await?
            .get(bundle_id)
            .map(|e| e.owner_entity_id.clone())
            .ok_or_else(not_shared)?;

        let path = record_path(&owner, bundle_id);
        let _bundle_guard = self.locks.acquire(&path).await?;

        let bundle = self.bundles.get(&path).await?;
        let Some(bundle) = bundle.filter(|b| b.member(entity_id).is_some()) else {
            // Index entry without a matching member: drop the stale entry.
            let failures = self.detach_orphan(entity_id, bundle_id).await;
            if failures.iter().any(|f| f.kind == MemberFailureKind::Index) {
                return Err(BundleError::Incomplete { failures });
            }
            return Ok(MembershipUpdate {
                public_keys: BTreeMap::new(),
                failures,
            });
        };

        let proposed: Vec<_> = bundle
            .users
            .iter()
            .filter(|m| m.entity_id != entity_id)
            .cloned()
            .collect();
        let (stored, failures) = self.commit(bundle, proposed).await?;
        if stored.member(entity_id).is_some() {
            return Err(BundleError::Incomplete { failures });
        }

        info!(entity_id = %entity_id, bundle_id = %bundle_id, "share declined");
        Ok(MembershipUpdate {
            public_keys: BTreeMap::new(),
            failures,
        })
    }

    /// Delete a bundle after detaching every member.
    ///
    /// Only the owner may delete. Policy push failures are returned but do
    /// not stop the delete.
    ///
    /// # Errors
    ///
    /// - [`BundleError::NotFound`] or [`BundleError::NotAuthorized`].
    /// - [`BundleError::Incomplete`] if any member's index could not be
    ///   cleared. The record is kept with `wal_entry = true` so the delete can
    ///   be retried.
    /// - [`BundleError::LockTimeout`] or [`BundleError::Storage`].
    pub async fn delete_bundle(
        &self,
        owner_entity_id: &str,
        bundle_id: &str,
        requester_entity_id: &str,
    ) -> Result<Vec<MemberFailure>, BundleError> {
        let path = record_path(owner_entity_id, bundle_id);
        let _bundle_guard = self.locks.acquire(&path).await?;

        let mut bundle = self.bundles.get(&path).await?.ok_or(BundleError::NotFound)?;
        if requester_entity_id != bundle.owner_entity_id {
            return Err(BundleError::NotAuthorized);
        }

        bundle.wal_entry = true;
        self.bundles.put(&bundle).await?;

        let detaches = bundle.users.iter().map(|m| {
            self.sync_member(
                &m.entity_id,
                &m.entity_name,
                IndexChange::Remove {
                    bundle_id: &bundle.id,
                },
            )
        });
        let failures: Vec<MemberFailure> = join_all(detaches).await.into_iter().flatten().collect();

        if failures.iter().any(|f| f.kind == MemberFailureKind::Index) {
            warn!(bundle_id = %bundle_id, "bundle delete incomplete, record kept");
            return Err(BundleError::Incomplete { failures });
        }

        self.bundles.delete(&bundle).await?;
        info!(owner = %owner_entity_id, bundle_id = %bundle_id, "bundle deleted");
        Ok(failures)
    }

    /// Re-render and push `entity_id`'s policy, clearing a degraded marker.
    ///
    /// # Errors
    ///
    /// - [`BundleError::InvalidRequest`] if the entity is not registered.
    /// - [`BundleError::Policy`] if the push still fails.
    /// - [`BundleError::LockTimeout`] or [`BundleError::Storage`].
    pub async fn resync_policy(&self, entity_id: &str) -> Result<(), BundleError> {
        let entry = self.users.get(entity_id).await?;
        let _guard = self.locks.acquire(&shared_index_path(entity_id)).await?;
        let index = self.bundles.shared_index(entity_id).await?;
        self.push_policy(entity_id, &entry.entity_name, &index).await?;
        info!(entity_id = %entity_id, "policy resynced");
        Ok(())
    }

    /// The degraded-policy marker for `entity_id`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`BundleError::Policy`] if the marker cannot be read.
    pub async fn policy_status(&self, entity_id: &str) -> Result<Option<PolicyStatus>, BundleError> {
        Ok(self.statuses.get(entity_id).await?)
    }

    async fn lookup_member(&self, entity_name: &str) -> Result<(String, PublicJwk), BundleError> {
        let lookup = |reason: &str| BundleError::Lookup {
            entity_name: entity_name.to_owned(),
            reason: reason.to_owned(),
        };
        let entity_id = match self.users.resolve_entity_id(entity_name).await {
            Ok(id) => id,
            Err(UserError::UnknownName { .. }) => return Err(lookup("no entity has this name")),
            Err(e) => return Err(e.into()),
        };
        match self.users.public_key(&entity_id).await {
            Ok(key) => Ok((entity_id, key)),
            Err(UserError::NotFound { .. }) => Err(lookup("no registered unlock key")),
            Err(e) => Err(e.into()),
        }
    }

    /// Steps 2 to 4 of the protocol. The caller holds the bundle lock and
    /// has authorized the change. Returns the record as stored.
    async fn commit(
        &self,
        mut bundle: Bundle,
        mut proposed: Vec<BundleMember>,
    ) -> Result<(Bundle, Vec<MemberFailure>), BundleError> {
        let recovering = bundle.wal_entry;
        bundle.wal_entry = true;
        self.bundles.put(&bundle).await?;
        if recovering {
            warn!(bundle_id = %bundle.id, "previous membership update incomplete, re-propagating all members");
        }

        let now = chrono::Utc::now().timestamp();
        let mut modified = Vec::new();
        for member in &mut proposed {
            match bundle.member(&member.entity_id) {
                Some(old) => {
                    member.shared_timestamp = old.shared_timestamp;
                    // Names are bound to entities once at registration, so
                    // a policy name never changes under a member.
                    let changed = old.capabilities != member.capabilities
                        || old.is_admin != member.is_admin
                        || old.entity_name != member.entity_name;
                    if recovering || changed {
                        modified.push(member.clone());
                    }
                }
                None => {
                    member.shared_timestamp = now;
                    modified.push(member.clone());
                }
            }
        }

        let keep: HashSet<&str> = proposed.iter().map(|m| m.entity_id.as_str()).collect();
        let removed: Vec<BundleMember> = bundle
            .users
            .iter()
            .filter(|m| !keep.contains(m.entity_id.as_str()))
            .cloned()
            .collect();

        let (removal_results, upsert_results) = {
            let snapshot = &bundle;
            let removals = removed.iter().map(|m| {
                self.sync_member(
                    &m.entity_id,
                    &m.entity_name,
                    IndexChange::Remove {
                        bundle_id: &snapshot.id,
                    },
                )
            });
            let upserts = modified.iter().map(|m| {
                self.sync_member(
                    &m.entity_id,
                    &m.entity_name,
                    IndexChange::Upsert {
                        bundle: snapshot,
                        member: m,
                    },
                )
            });
            futures::join!(join_all(removals), join_all(upserts))
        };

        let mut failures = Vec::new();
        let mut index_failed = false;
        for (member, result) in removed.into_iter().zip(removal_results) {
            if result.iter().any(|f| f.kind == MemberFailureKind::Index) {
                index_failed = true;
                proposed.push(member);
            }
            failures.extend(result);
        }
        for result in upsert_results {
            index_failed |= result.iter().any(|f| f.kind == MemberFailureKind::Index);
            failures.extend(result);
        }

        for failure in &failures {
            warn!(bundle_id = %bundle.id, entity_id = %failure.entity_id, kind = ?failure.kind, reason = %failure.reason, "member update failed");
        }

        bundle.users = proposed;
        bundle.wal_entry = index_failed;
        self.bundles.put(&bundle).await?;
        Ok((bundle, failures))
    }

    /// Remove a stale index entry for a bundle the entity is not a member of.
    async fn detach_orphan(&self, entity_id: &str, bundle_id: &str) -> Vec<MemberFailure> {
        let entity_name = match self.users.get(entity_id).await {
            Ok(entry) => entry.entity_name,
            Err(e) => {
                return vec![MemberFailure {
                    entity_id: entity_id.to_owned(),
                    kind: MemberFailureKind::Index,
                    reason: e.to_string(),
                }];
            }
        };
        self.sync_member(entity_id, &entity_name, IndexChange::Remove { bundle_id })
            .await
    }

    /// One member's sub-update under that member's index lock: rewrite the
    /// index, then push the policy rendered from it.
    async fn sync_member(
        &self,
        entity_id: &str,
        entity_name: &str,
        change: IndexChange<'_>,
    ) -> Vec<MemberFailure> {
        let failure = |kind, reason: String| MemberFailure {
            entity_id: entity_id.to_owned(),
            kind,
            reason,
        };

        let index_path = shared_index_path(entity_id);
        let _guard = match self.locks.acquire(&index_path).await {
            Ok(guard) => guard,
            Err(e) => return vec![failure(MemberFailureKind::Index, e.to_string())],
        };

        let mut index = match self.bundles.shared_index(entity_id).await {
            Ok(index) => index,
            Err(e) => return vec![failure(MemberFailureKind::Index, e.to_string())],
        };
        apply_change(&mut index, &change);
        if let Err(e) = self.bundles.put_shared_index(entity_id, &index).await {
            return vec![failure(MemberFailureKind::Index, e.to_string())];
        }

        match self.push_policy(entity_id, entity_name, &index).await {
            Ok(()) => Vec::new(),
            Err(e) => vec![failure(MemberFailureKind::PolicyPush, e.to_string())],
        }
    }

    /// Push the policy for `index`, or delete it when the index is empty.
    /// Tracks the degraded marker either way.
    async fn push_policy(
        &self,
        entity_id: &str,
        entity_name: &str,
        index: &SharedIndex,
    ) -> Result<(), PolicyError> {
        let name = policy_name(&self.config.mount, entity_name);
        let result = if index.is_empty() {
            self.retry(&name, || self.engine.delete_policy(&name)).await
        } else {
            match render_policy(index) {
                Ok(rules) => {
                    self.retry(&name, || self.engine.put_policy(&name, &rules))
                        .await
                }
                Err(e) => Err(e),
            }
        };

        match &result {
            Ok(()) => {
                if let Err(e) = self.statuses.clear(entity_id).await {
                    warn!(entity_id = %entity_id, error = %e, "failed to clear policy status");
                }
            }
            Err(err) => {
                warn!(entity_id = %entity_id, policy = %name, error = %err, "policy degraded");
                let status = PolicyStatus {
                    entity_id: entity_id.to_owned(),
                    policy_name: name.clone(),
                    reason: err.to_string(),
                    since: chrono::Utc::now().timestamp(),
                };
                if let Err(e) = self.statuses.mark_degraded(&status).await {
                    warn!(entity_id = %entity_id, error = %e, "failed to record policy status");
                }
            }
        }
        result
    }

    async fn retry<F, Fut>(&self, name: &str, op: F) -> Result<(), PolicyError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), PolicyError>>,
    {
        let mut delay = self.config.policy_retry_backoff;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.config.policy_push_retries => {
                    attempt += 1;
                    debug!(policy = %name, attempt, error = %err, "retrying policy push");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn apply_change(index: &mut SharedIndex, change: &IndexChange<'_>) {
    match change {
        IndexChange::Upsert { bundle, member } => {
            let now = chrono::Utc::now().timestamp();
            index
                .entry(bundle.id.clone())
                .and_modify(|entry| {
                    entry.capabilities = member.capabilities.clone();
                    entry.is_admin = member.is_admin;
                    entry.created = now;
                })
                .or_insert_with(|| SharedBundle::for_member(bundle, member, now));
        }
        IndexChange::Remove { bundle_id } => {
            index.remove(*bundle_id);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use keyshelf_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::test_support::{RecordingPolicyEngine, uuk_for};

    struct Fixture {
        backend: MemoryBackend,
        engine: Arc<RecordingPolicyEngine>,
        users: UserStore,
        bundles: BundleStore,
        manager: BundleAccessManager,
    }

    async fn fixture() -> Fixture {
        let backend = MemoryBackend::new();
        let storage: Arc<dyn StorageBackend> = Arc::new(backend.clone());
        let engine = Arc::new(RecordingPolicyEngine::default());
        let users = UserStore::new(Arc::clone(&storage));
        let bundles = BundleStore::new(Arc::clone(&storage));
        let config = AccessConfig {
            policy_retry_backoff: Duration::from_millis(1),
            lock_timeout: Some(Duration::from_secs(5)),
            ..AccessConfig::default()
        };
        let manager = BundleAccessManager::new(
            bundles.clone(),
            users.clone(),
            Arc::clone(&engine) as Arc<dyn PolicyEngine>,
            PolicyStatusStore::new(Arc::clone(&storage)),
            config,
        );

        for (id, name) in [
            ("e-owner", "owner"),
            ("e-alice", "alice"),
            ("e-bob", "bob"),
            ("e-carol", "carol"),
        ] {
            users.register(id, name, uuk_for(id)).await.unwrap();
        }

        Fixture {
            backend,
            engine,
            users,
            bundles,
            manager,
        }
    }

    fn spec(name: &str, is_admin: bool, caps: &str) -> MemberSpec {
        MemberSpec {
            entity_name: name.to_owned(),
            is_admin,
            capabilities: caps.parse().unwrap(),
        }
    }

    fn request(specs: Vec<MemberSpec>) -> MemberUpdateRequest {
        MemberUpdateRequest { users: specs }
    }

    async fn assert_in_sync(f: &Fixture, bundle: &Bundle) {
        for member in &bundle.users {
            let index = f.bundles.shared_index(&member.entity_id).await.unwrap();
            let entry = index.get(&bundle.id).unwrap();
            assert_eq!(entry.capabilities, member.capabilities);
            assert_eq!(entry.is_admin, member.is_admin);
        }
    }

    #[tokio::test]
    async fn owner_shares_with_alice() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        let before = chrono::Utc::now().timestamp();

        let update = f
            .manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read,list")]),
            )
            .await
            .unwrap();

        let alice_key = f.users.public_key("e-alice").await.unwrap();
        assert_eq!(update.public_keys.len(), 1);
        assert_eq!(update.public_keys["e-alice"], alice_key);
        assert_eq!(alice_key.e, "AQAB");
        assert!(update.failures.is_empty());

        let stored = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert!(!stored.wal_entry);
        assert_eq!(stored.users.len(), 1);
        assert_eq!(stored.users[0].entity_id, "e-alice");
        assert!(stored.users[0].shared_timestamp >= before);

        let shared = f.bundles.list_shared("e-alice").await.unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].id, bundle.id);
        assert_eq!(shared[0].capabilities.to_string(), "read,list");
        assert!(!shared[0].is_admin);
        assert!(!shared[0].has_accepted);

        let rules = f.engine.policy("pwmanager/entity/alice").unwrap();
        assert!(rules.contains(&format!("path \"bundles/data/e-owner/{}/*\"", bundle.id)));
        assert!(rules.contains(&format!("path \"bundles/metadata/e-owner/{}/*\"", bundle.id)));
        assert!(rules.contains("capabilities = [\"read\", \"list\"]"));
    }

    #[tokio::test]
    async fn sync_invariant_holds_across_add_modify_remove() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();

        f.manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![
                    spec("alice", false, "read"),
                    spec("bob", true, "read,list"),
                ]),
            )
            .await
            .unwrap();
        let first = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert_in_sync(&f, &first).await;
        let alice_granted = first.member("e-alice").unwrap().shared_timestamp;

        f.manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![
                    spec("alice", true, "create,read,update"),
                    spec("carol", false, "read"),
                ]),
            )
            .await
            .unwrap();
        let second = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert_in_sync(&f, &second).await;
        assert_eq!(second.member("e-alice").unwrap().shared_timestamp, alice_granted);
        assert!(second.member("e-bob").is_none());

        assert!(f.bundles.shared_index("e-bob").await.unwrap().is_empty());
        assert!(f.engine.policy("pwmanager/entity/bob").is_none());
        assert!(f.engine.deleted().contains(&"pwmanager/entity/bob".to_owned()));
    }

    #[tokio::test]
    async fn unchanged_members_are_not_rewritten() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        let req = request(vec![spec("alice", false, "read")]);
        f.manager
            .update_members("e-owner", &bundle.id, "e-owner", &req)
            .await
            .unwrap();
        let pushes = f.engine.put_count();

        f.manager
            .update_members("e-owner", &bundle.id, "e-owner", &req)
            .await
            .unwrap();
        assert_eq!(f.engine.put_count(), pushes);
    }

    #[tokio::test]
    async fn editing_a_member_rewrites_the_same_policy() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        for caps in ["read", "read,list", "create,read"] {
            f.manager
                .update_members(
                    "e-owner",
                    &bundle.id,
                    "e-owner",
                    &request(vec![spec("alice", false, caps)]),
                )
                .await
                .unwrap();
        }

        assert!(f.engine.deleted().is_empty());
        let rules = f.engine.policy("pwmanager/entity/alice").unwrap();
        assert!(rules.contains(r#"capabilities = ["create", "read"]"#), "{rules}");
    }

    #[tokio::test]
    async fn crash_recovery_repropagates_every_member() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        let req = request(vec![
            spec("alice", false, "read"),
            spec("bob", false, "read,list"),
            spec("carol", true, "read"),
        ]);
        f.manager
            .update_members("e-owner", &bundle.id, "e-owner", &req)
            .await
            .unwrap();

        // Simulate a crash mid-update: marker left set, indexes lost.
        let mut stored = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        stored.wal_entry = true;
        f.bundles.put(&stored).await.unwrap();
        for id in ["e-alice", "e-bob", "e-carol"] {
            f.bundles.put_shared_index(id, &SharedIndex::new()).await.unwrap();
        }
        let pushes = f.engine.put_count();

        f.manager
            .update_members("e-owner", &bundle.id, "e-owner", &req)
            .await
            .unwrap();

        assert_eq!(f.engine.put_count(), pushes + 3);
        let recovered = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert!(!recovered.wal_entry);
        assert_in_sync(&f, &recovered).await;
    }

    #[tokio::test]
    async fn unauthorized_requester_changes_nothing() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        f.manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read")]),
            )
            .await
            .unwrap();

        let record_before = f.backend.get(&bundle.record_path()).await.unwrap();
        let index_before = f.backend.get(&shared_index_path("e-alice")).await.unwrap();
        let pushes = f.engine.put_count();

        for requester in ["e-alice", "e-stranger"] {
            let err = f
                .manager
                .update_members(
                    "e-owner",
                    &bundle.id,
                    requester,
                    &request(vec![spec("bob", true, "read")]),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, BundleError::NotAuthorized));
        }

        assert_eq!(f.backend.get(&bundle.record_path()).await.unwrap(), record_before);
        assert_eq!(
            f.backend.get(&shared_index_path("e-alice")).await.unwrap(),
            index_before
        );
        assert!(f.bundles.shared_index("e-bob").await.unwrap().is_empty());
        assert_eq!(f.engine.put_count(), pushes);
    }

    #[tokio::test]
    async fn admin_member_may_update() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        f.manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", true, "read")]),
            )
            .await
            .unwrap();

        let update = f
            .manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-alice",
                &request(vec![spec("alice", true, "read"), spec("bob", false, "read")]),
            )
            .await
            .unwrap();
        assert_eq!(update.public_keys.len(), 2);
    }

    #[tokio::test]
    async fn unregistered_member_aborts_before_any_write() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        let before = f.backend.get(&bundle.record_path()).await.unwrap();

        let err = f
            .manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read"), spec("mallory", false, "read")]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::Lookup { ref entity_name, .. } if entity_name == "mallory"));
        assert_eq!(f.backend.get(&bundle.record_path()).await.unwrap(), before);
        assert!(f.bundles.shared_index("e-alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_requests_are_rejected() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();

        for req in [
            request(vec![spec("alice", false, "read"), spec("alice", true, "read")]),
            request(vec![spec("  ", false, "read")]),
            request(vec![spec("owner", false, "read")]),
        ] {
            let err = f
                .manager
                .update_members("e-owner", &bundle.id, "e-owner", &req)
                .await
                .unwrap_err();
            assert!(matches!(err, BundleError::InvalidRequest { .. }), "{err}");
        }
    }

    #[tokio::test]
    async fn missing_bundle_is_not_found() {
        let f = fixture().await;
        let err = f
            .manager
            .update_members("e-owner", "nope", "e-owner", &request(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::NotFound));
    }

    #[tokio::test]
    async fn removing_last_member_keeps_bundle() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        f.manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read")]),
            )
            .await
            .unwrap();
        f.manager
            .update_members("e-owner", &bundle.id, "e-owner", &request(vec![]))
            .await
            .unwrap();

        let stored = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert!(stored.users.is_empty());
        assert!(f.bundles.shared_index("e-alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn index_failure_is_isolated_and_keeps_marker() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        f.backend.fail_writes_under("bundles/e-bob/").await;

        let update = f
            .manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read"), spec("bob", false, "read")]),
            )
            .await
            .unwrap();

        assert_eq!(update.failures.len(), 1);
        assert_eq!(update.failures[0].entity_id, "e-bob");
        assert_eq!(update.failures[0].kind, MemberFailureKind::Index);
        assert_eq!(f.bundles.list_shared("e-alice").await.unwrap().len(), 1);

        let stored = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert!(stored.wal_entry);

        f.backend.clear_write_failures().await;
        let retried = f
            .manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read"), spec("bob", false, "read")]),
            )
            .await
            .unwrap();
        assert!(retried.failures.is_empty());
        let stored = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert!(!stored.wal_entry);
        assert_in_sync(&f, &stored).await;
    }

    #[tokio::test]
    async fn failed_removal_keeps_member_for_retry() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        f.manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read")]),
            )
            .await
            .unwrap();

        f.backend.fail_writes_under("bundles/e-alice/").await;
        let update = f
            .manager
            .update_members("e-owner", &bundle.id, "e-owner", &request(vec![]))
            .await
            .unwrap();
        assert_eq!(update.failures[0].kind, MemberFailureKind::Index);
        let stored = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert!(stored.member("e-alice").is_some());
        assert!(stored.wal_entry);

        f.backend.clear_write_failures().await;
        f.manager
            .update_members("e-owner", &bundle.id, "e-owner", &request(vec![]))
            .await
            .unwrap();
        let stored = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert!(stored.users.is_empty());
        assert!(f.bundles.shared_index("e-alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn policy_push_is_retried_then_succeeds() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        f.engine.fail_next(2);

        let update = f
            .manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read")]),
            )
            .await
            .unwrap();
        assert!(update.failures.is_empty());
        assert!(f.engine.policy("pwmanager/entity/alice").is_some());
        assert!(f.manager.policy_status("e-alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistent_push_failure_marks_degraded_until_resync() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        f.engine.fail_always("pwmanager/entity/alice");

        let update = f
            .manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read")]),
            )
            .await
            .unwrap();
        assert_eq!(update.failures.len(), 1);
        assert_eq!(update.failures[0].kind, MemberFailureKind::PolicyPush);

        // The index is durable and the record is complete.
        let stored = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert!(!stored.wal_entry);
        assert_in_sync(&f, &stored).await;

        let status = f.manager.policy_status("e-alice").await.unwrap().unwrap();
        assert_eq!(status.policy_name, "pwmanager/entity/alice");

        assert!(matches!(
            f.manager.resync_policy("e-alice").await,
            Err(BundleError::Policy(_))
        ));

        f.engine.heal();
        f.manager.resync_policy("e-alice").await.unwrap();
        assert!(f.manager.policy_status("e-alice").await.unwrap().is_none());
        assert!(f.engine.policy("pwmanager/entity/alice").is_some());
    }

    #[tokio::test]
    async fn accept_sets_flag_and_survives_later_edits() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        f.manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read")]),
            )
            .await
            .unwrap();

        f.manager
            .respond_to_share("e-alice", &bundle.id, true)
            .await
            .unwrap();
        assert!(f.bundles.list_shared("e-alice").await.unwrap()[0].has_accepted);

        f.manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read,list")]),
            )
            .await
            .unwrap();
        let shared = f.bundles.list_shared("e-alice").await.unwrap();
        assert!(shared[0].has_accepted);
        assert_eq!(shared[0].capabilities.to_string(), "read,list");
    }

    #[tokio::test]
    async fn decline_removes_member_through_protocol() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        f.manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read"), spec("bob", false, "read")]),
            )
            .await
            .unwrap();

        f.manager
            .respond_to_share("e-alice", &bundle.id, false)
            .await
            .unwrap();

        let stored = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert!(stored.member("e-alice").is_none());
        assert!(stored.member("e-bob").is_some());
        assert!(f.bundles.shared_index("e-alice").await.unwrap().is_empty());
        assert!(f.engine.deleted().contains(&"pwmanager/entity/alice".to_owned()));
    }

    #[tokio::test]
    async fn respond_to_unknown_share_fails() {
        let f = fixture().await;
        for accept in [true, false] {
            assert!(matches!(
                f.manager.respond_to_share("e-alice", "nope", accept).await,
                Err(BundleError::NotShared { .. })
            ));
        }
    }

    #[tokio::test]
    async fn delete_detaches_members_then_removes_record() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        let other = f.bundles.create("e-owner").await.unwrap();
        for b in [&bundle, &other] {
            f.manager
                .update_members(
                    "e-owner",
                    &b.id,
                    "e-owner",
                    &request(vec![spec("alice", false, "read")]),
                )
                .await
                .unwrap();
        }

        let err = f
            .manager
            .delete_bundle("e-owner", &bundle.id, "e-alice")
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::NotAuthorized));

        f.manager
            .delete_bundle("e-owner", &bundle.id, "e-owner")
            .await
            .unwrap();
        assert!(f.bundles.get(&bundle.record_path()).await.unwrap().is_none());

        let shared = f.bundles.list_shared("e-alice").await.unwrap();
        assert_eq!(shared.len(), 1);
        assert_eq!(shared[0].id, other.id);
        let rules = f.engine.policy("pwmanager/entity/alice").unwrap();
        assert!(!rules.contains(&bundle.id));
        assert!(rules.contains(&other.id));
    }

    #[tokio::test]
    async fn incomplete_delete_keeps_record_with_marker() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        f.manager
            .update_members(
                "e-owner",
                &bundle.id,
                "e-owner",
                &request(vec![spec("alice", false, "read")]),
            )
            .await
            .unwrap();

        f.backend.fail_writes_under("bundles/e-alice/").await;
        let err = f
            .manager
            .delete_bundle("e-owner", &bundle.id, "e-owner")
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::Incomplete { ref failures } if failures.len() == 1));
        let kept = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert!(kept.wal_entry);

        f.backend.clear_write_failures().await;
        f.manager
            .delete_bundle("e-owner", &bundle.id, "e-owner")
            .await
            .unwrap();
        assert!(f.bundles.get(&bundle.record_path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_updates_on_same_bundle_serialize() {
        let f = Arc::new(fixture().await);
        let bundle = f.bundles.create("e-owner").await.unwrap();

        let tasks: Vec<_> = ["alice", "bob", "carol"]
            .into_iter()
            .map(|name| {
                let f = Arc::clone(&f);
                let id = bundle.id.clone();
                tokio::spawn(async move {
                    f.manager
                        .update_members(
                            "e-owner",
                            &id,
                            "e-owner",
                            &request(vec![spec(name, false, "read")]),
                        )
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let stored = f.bundles.get(&bundle.record_path()).await.unwrap().unwrap();
        assert_eq!(stored.users.len(), 1);
        assert!(!stored.wal_entry);
        assert_in_sync(&f, &stored).await;

        // Whichever update ran last wins; the others' grants are gone.
        for id in ["e-alice", "e-bob", "e-carol"] {
            let has_entry = f
                .bundles
                .shared_index(id)
                .await
                .unwrap()
                .contains_key(&bundle.id);
            assert_eq!(has_entry, stored.member(id).is_some());
        }
    }

    #[tokio::test]
    async fn lock_timeout_is_reported() {
        let f = fixture().await;
        let bundle = f.bundles.create("e-owner").await.unwrap();
        let manager = BundleAccessManager::new(
            f.bundles.clone(),
            f.users.clone(),
            Arc::clone(&f.engine) as Arc<dyn PolicyEngine>,
            PolicyStatusStore::new(Arc::new(f.backend.clone())),
            AccessConfig {
                lock_timeout: Some(Duration::from_millis(20)),
                ..AccessConfig::default()
            },
        );

        let _held = manager.locks.acquire(&bundle.record_path()).await.unwrap();
        let err = manager
            .update_members("e-owner", &bundle.id, "e-owner", &request(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, BundleError::LockTimeout { .. }));
    }
}
