//! Error types for `keyshelf-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto errors never include key material, and a failed open of
//! any envelope layer collapses into [`CryptoError::Authentication`] so that
//! callers cannot tell which stage rejected their input.

use keyshelf_storage::StorageError;

/// Errors from key derivation, envelope sealing and public-key operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Stored KDF parameters are malformed (bad hex, wrong salt length,
    /// zero iterations). Signals data corruption; not retryable.
    #[error("key derivation failed: {reason}")]
    Derivation { reason: String },

    /// An envelope or ciphertext could not be opened. Deliberately carries no
    /// detail about which layer failed.
    #[error("authentication failed")]
    Authentication,

    /// RSA key generation failed.
    #[error("key generation failed: {reason}")]
    Keygen { reason: String },

    /// AES-256-GCM or RSA-OAEP encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// A serialized key, envelope or token is structurally invalid.
    #[error("invalid encoding of {field}: {reason}")]
    Encoding { field: String, reason: String },
}

/// Errors from the user unlock key registry.
#[derive(Debug, thiserror::Error)]
pub enum UserError {
    /// The entity already has a registered unlock key.
    #[error("entity '{entity_id}' is already registered")]
    AlreadyRegistered { entity_id: String },

    /// The display name is bound to a different entity.
    #[error("entity name '{entity_name}' is already taken")]
    NameTaken { entity_name: String },

    /// No unlock key is registered for the entity.
    #[error("no registered unlock key for entity '{entity_id}'")]
    NotFound { entity_id: String },

    /// No entity is registered under the display name.
    #[error("unknown entity name '{entity_name}'")]
    UnknownName { entity_name: String },

    /// The entity id or name supplied by the host is unusable as a key.
    #[error("invalid identity: {reason}")]
    InvalidIdentity { reason: String },

    /// Another registration for the same entity or name held the lock too long.
    #[error("timed out waiting for lock on '{path}'")]
    LockTimeout { path: String },

    /// The registration payload failed validation.
    #[error("invalid registration: {0}")]
    Invalid(#[from] CryptoError),

    /// A stored record could not be (de)serialized.
    #[error("user record serialization failed: {reason}")]
    Serialization { reason: String },

    /// The storage backend returned an error.
    #[error("user storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from policy rendering and the external policy engine.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// A bundle path cannot be split into data and metadata paths.
    #[error("bundle path is invalid: {path}")]
    InvalidPath { path: String },

    /// The policy engine rejected or failed to store a policy.
    #[error("failed to push policy '{name}': {reason}")]
    Push { name: String, reason: String },

    /// The storage backend returned an error.
    #[error("policy storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from bundle storage and the sharing protocol.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// The referenced bundle does not exist.
    #[error("bundle not found")]
    NotFound,

    /// The referenced bundle is not shared with the caller.
    #[error("bundle '{bundle_id}' is not shared with this entity")]
    NotShared { bundle_id: String },

    /// The requester is neither the owner nor an admin of the bundle.
    #[error("not authorized")]
    NotAuthorized,

    /// A named member has not registered an unlock key (or the name does not
    /// resolve to an entity).
    #[error("member '{entity_name}' cannot be enrolled: {reason}")]
    Lookup { entity_name: String, reason: String },

    /// The request failed boundary validation.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// A per-resource lock could not be acquired within the configured bound.
    #[error("timed out waiting for lock on '{path}'")]
    LockTimeout { path: String },

    /// One or more members could not be detached while deleting a bundle.
    /// The bundle record is kept with its write-ahead marker set.
    #[error("bundle deletion incomplete: {} member update(s) failed", failures.len())]
    Incomplete { failures: Vec<MemberFailure> },

    /// A stored record could not be (de)serialized.
    #[error("bundle record serialization failed: {reason}")]
    Serialization { reason: String },

    /// Rendering or pushing a policy failed outside of a membership update.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The storage backend returned an error.
    #[error("bundle storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<UserError> for BundleError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::Storage(e) => Self::Storage(e),
            UserError::Serialization { reason } => Self::Serialization { reason },
            UserError::LockTimeout { path } => Self::LockTimeout { path },
            other => Self::InvalidRequest {
                reason: other.to_string(),
            },
        }
    }
}

/// A failure confined to one member's sub-update.
///
/// Produced after authorization has passed, when one member's shared index or
/// policy could not be brought up to date. Other members are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct MemberFailure {
    /// Entity whose sub-update failed.
    pub entity_id: String,
    /// Which step failed.
    pub kind: MemberFailureKind,
    /// Human-readable cause.
    pub reason: String,
}

/// The step of a member sub-update that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberFailureKind {
    /// Reading or writing the member's shared index failed. The bundle keeps
    /// its write-ahead marker so the next update re-propagates.
    Index,
    /// The shared index is durable but the policy push failed after retries.
    /// The member's policy status is flagged degraded.
    PolicyPush,
}

impl std::fmt::Display for MemberFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:?}): {}", self.entity_id, self.kind, self.reason)
    }
}
