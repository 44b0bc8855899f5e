//! Policy engine backed by a Vault-compatible HTTP API.
//!
//! Policies are written with `PUT {addr}/v1/sys/policies/acl/{name}` and
//! removed with `DELETE` on the same path, authenticated by `X-Vault-Token`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use tracing::info;

use keyshelf_core::{PolicyEngine, PolicyError};

const TOKEN_HEADER: &str = "X-Vault-Token";

#[derive(Serialize)]
struct PolicyBody<'a> {
    policy: &'a str,
}

/// Pushes rendered policies to a remote engine.
#[derive(Clone)]
pub struct VaultPolicyEngine {
    client: reqwest::Client,
    addr: String,
    token: String,
}

impl std::fmt::Debug for VaultPolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultPolicyEngine")
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

impl VaultPolicyEngine {
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(addr: &str, token: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            addr: addr.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
        })
    }

    fn url(&self, name: &str) -> String {
        format!("{}/v1/sys/policies/acl/{name}", self.addr)
    }
}

fn push_error(name: &str, reason: impl std::fmt::Display) -> PolicyError {
    PolicyError::Push {
        name: name.to_owned(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl PolicyEngine for VaultPolicyEngine {
    async fn put_policy(&self, name: &str, rules: &str) -> Result<(), PolicyError> {
        let resp = self
            .client
            .put(self.url(name))
            .header(TOKEN_HEADER, &self.token)
            .json(&PolicyBody { policy: rules })
            .send()
            .await
            .map_err(|e| push_error(name, e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(push_error(name, format!("HTTP {status}: {body}")));
        }
        info!(name = %name, "policy pushed");
        Ok(())
    }

    async fn delete_policy(&self, name: &str) -> Result<(), PolicyError> {
        let resp = self
            .client
            .delete(self.url(name))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| push_error(name, e))?;

        let status = resp.status();
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_default();
            return Err(push_error(name, format!("HTTP {status}: {body}")));
        }
        info!(name = %name, "policy removed");
        Ok(())
    }
}
