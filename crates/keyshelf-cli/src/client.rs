//! HTTP client for the keyshelf server.
//!
//! In production a host sits in front of the server and injects the caller
//! identity headers after authenticating the user. Talking to the server
//! directly, the client sends them itself.

use anyhow::{Context, Result, bail};
use serde_json::Value;

pub struct Client {
    http: reqwest::Client,
    addr: String,
    entity_id: Option<String>,
    entity_name: Option<String>,
}

impl Client {
    pub fn new(addr: &str, entity_id: Option<String>, entity_name: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            addr: addr.trim_end_matches('/').to_owned(),
            entity_id,
            entity_name,
        }
    }

    pub fn entity_id(&self) -> Result<&str> {
        self.entity_id
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no entity id, set KEYSHELF_ENTITY_ID or use --entity-id"))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.addr)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let mut builder = self
            .http
            .request(method, self.url(path))
            .header("X-Entity-Id", self.entity_id()?);
        if let Some(name) = &self.entity_name {
            builder = builder.header("X-Entity-Name", name);
        }
        Ok(builder)
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let resp = self
            .request(reqwest::Method::GET, path)?
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let resp = self
            .request(reqwest::Method::POST, path)?
            .json(body)
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }

    pub async fn post_no_body(&self, path: &str) -> Result<Value> {
        let resp = self
            .request(reqwest::Method::POST, path)?
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        let resp = self
            .request(reqwest::Method::DELETE, path)?
            .send()
            .await
            .context("request failed")?;
        handle_response(resp).await
    }
}

async fn handle_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if status == reqwest::StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    let body = resp.text().await.context("failed to read response body")?;
    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v["message"].as_str().map(str::to_owned))
            .unwrap_or(body);
        bail!("server returned {status}: {message}");
    }
    if body.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body).context("failed to parse response JSON")
}
