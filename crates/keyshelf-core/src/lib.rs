//! Core library for keyshelf.
//!
//! Contains the two-source key derivation, the user unlock key envelope,
//! the user registry, bundle records and the sharing protocol that keeps
//! bundle membership, shared-with-me indexes and access policies in step.
//! This crate depends on `keyshelf-storage` for the storage backend trait
//! and knows nothing about HTTP or the external policy engine's wire format.

pub mod access;
pub mod bundle;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod jwk;
pub mod kdf;
pub mod lock;
pub mod policy;
pub mod user;
pub mod uuk;

pub use access::{AccessConfig, BundleAccessManager, MemberSpec, MemberUpdateRequest, MembershipUpdate};
pub use bundle::{Bundle, BundleMember, BundleStore, Capabilities, Capability, SharedBundle};
pub use error::{BundleError, CryptoError, MemberFailure, MemberFailureKind, PolicyError, UserError};
pub use kdf::Credentials;
pub use policy::{PolicyEngine, PolicyStatus, PolicyStatusStore, StoragePolicyEngine};
pub use user::{UserEntry, UserStore};
pub use uuk::{BuildOptions, Uuk};
