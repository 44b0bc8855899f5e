//! Policy maintenance: `/v1/policy/*`
//!
//! A policy push that kept failing during a membership change leaves the
//! caller's policy marked degraded. These routes expose the marker and let
//! the caller trigger a re-push of their own policy.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;

use keyshelf_core::PolicyStatus;

use crate::error::AppError;
use crate::middleware::Identity;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/status", get(status))
        .route("/resync", post(resync))
}

#[derive(Debug, Serialize)]
pub struct PolicyStatusResponse {
    pub degraded: bool,
    pub status: Option<PolicyStatus>,
}

async fn status(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<PolicyStatusResponse>, AppError> {
    let status = state.access.policy_status(&identity.entity_id).await?;
    Ok(Json(PolicyStatusResponse {
        degraded: status.is_some(),
        status,
    }))
}

async fn resync(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<PolicyStatusResponse>, AppError> {
    state.access.resync_policy(&identity.entity_id).await?;
    Ok(Json(PolicyStatusResponse {
        degraded: false,
        status: None,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use super::super::tests::{call, register, test_app};

    #[tokio::test]
    async fn resync_registered_caller() {
        let t = test_app();
        register(&t.app, "e-alice", "alice").await;
        let alice = Some(("e-alice", "alice"));

        let (status, body) = call(&t.app, Method::GET, "/v1/policy/status", alice, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["degraded"], false);

        let (status, _) = call(&t.app, Method::POST, "/v1/policy/resync", alice, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(&t.app, Method::POST, "/v1/policy/resync", Some(("e-x", "x")), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
