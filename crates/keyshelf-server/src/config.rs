//! Server configuration.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `KEYSHELF_*` environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use keyshelf_core::AccessConfig;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Storage backend type.
    pub storage_backend: StorageBackendType,
    /// Log level filter (e.g., `info`, `debug`, `warn`).
    pub log_level: String,
    /// Where rendered policies are pushed.
    pub policy_engine: PolicyEngineType,
    /// Mount name used in policy names.
    pub mount: String,
    /// Extra attempts after a failed policy push.
    pub policy_push_retries: u32,
    /// Bound on lock waits. `None` waits forever.
    pub lock_timeout: Option<Duration>,
}

/// Supported storage backend types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory (development only, data lost on restart).
    Memory,
    /// `RocksDB` persistent storage.
    RocksDb { path: String },
}

/// Supported policy engines.
#[derive(Clone, PartialEq, Eq)]
pub enum PolicyEngineType {
    /// Policies stored next to the data under `sys/policies/`.
    Local,
    /// A Vault-compatible server reached over HTTP.
    Vault { addr: String, token: String },
}

impl std::fmt::Debug for PolicyEngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("Local"),
            Self::Vault { addr, .. } => f
                .debug_struct("Vault")
                .field("addr", addr)
                .finish_non_exhaustive(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT`: port to bind on all interfaces
    /// - `KEYSHELF_BIND_ADDR`: full bind address (overrides `PORT`, default: `127.0.0.1:8300`)
    /// - `KEYSHELF_STORAGE`: `memory` or `rocksdb` (default: `memory`)
    /// - `KEYSHELF_STORAGE_PATH`: path for persistent backends (default: `./data`)
    /// - `KEYSHELF_LOG_LEVEL`: log filter (default: `info`)
    /// - `KEYSHELF_MOUNT`: mount used in policy names (default: `pwmanager`)
    /// - `KEYSHELF_POLICY_ENGINE`: `local` or `vault` (default: `local`)
    /// - `KEYSHELF_VAULT_ADDR`, `KEYSHELF_VAULT_TOKEN`: required for `vault`
    /// - `KEYSHELF_POLICY_PUSH_RETRIES`: retries per policy push (default: `3`)
    /// - `KEYSHELF_LOCK_TIMEOUT_SECS`: lock wait bound, `0` waits forever (default: `30`)
    ///
    /// # Errors
    ///
    /// Returns an error if `vault` is selected without an address and token.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`ServerConfig::from_env`].
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let default_addr = SocketAddr::from(([127, 0, 0, 1], 8300));
        let bind_addr = if let Some(addr) = var("KEYSHELF_BIND_ADDR") {
            addr.parse().unwrap_or(default_addr)
        } else if let Some(port) = var("PORT") {
            SocketAddr::from(([0, 0, 0, 0], port.parse().unwrap_or(8300)))
        } else {
            default_addr
        };

        let storage_path = var("KEYSHELF_STORAGE_PATH").unwrap_or_else(|| "./data".to_owned());
        let storage_backend = match var("KEYSHELF_STORAGE")
            .unwrap_or_else(|| "memory".to_owned())
            .to_lowercase()
            .as_str()
        {
            "rocksdb" => StorageBackendType::RocksDb { path: storage_path },
            _ => StorageBackendType::Memory,
        };

        let log_level = var("KEYSHELF_LOG_LEVEL").unwrap_or_else(|| "info".to_owned());

        let policy_engine = match var("KEYSHELF_POLICY_ENGINE")
            .unwrap_or_else(|| "local".to_owned())
            .to_lowercase()
            .as_str()
        {
            "vault" => {
                let addr = var("KEYSHELF_VAULT_ADDR").ok_or_else(|| {
                    anyhow::anyhow!("KEYSHELF_VAULT_ADDR is required for the vault policy engine")
                })?;
                let token = var("KEYSHELF_VAULT_TOKEN").ok_or_else(|| {
                    anyhow::anyhow!("KEYSHELF_VAULT_TOKEN is required for the vault policy engine")
                })?;
                PolicyEngineType::Vault {
                    addr: addr.trim_end_matches('/').to_owned(),
                    token,
                }
            }
            _ => PolicyEngineType::Local,
        };

        let defaults = AccessConfig::default();
        let mount = var("KEYSHELF_MOUNT").unwrap_or(defaults.mount);
        let policy_push_retries = var("KEYSHELF_POLICY_PUSH_RETRIES")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.policy_push_retries);
        let lock_timeout = match var("KEYSHELF_LOCK_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.lock_timeout,
        };

        Ok(Self {
            bind_addr,
            storage_backend,
            log_level,
            policy_engine,
            mount,
            policy_push_retries,
            lock_timeout,
        })
    }

    /// The access-manager settings carried by this configuration.
    #[must_use]
    pub fn access_config(&self) -> AccessConfig {
        AccessConfig {
            mount: self.mount.clone(),
            policy_push_retries: self.policy_push_retries,
            lock_timeout: self.lock_timeout,
            ..AccessConfig::default()
        }
    }
}
