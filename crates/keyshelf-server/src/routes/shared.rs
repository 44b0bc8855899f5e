//! Shared-with-me responses: `/v1/shared/{bundle_id}/{accept,decline}`

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::Serialize;

use keyshelf_core::MemberFailure;

use crate::error::AppError;
use crate::middleware::Identity;
use crate::routes::validate_segment;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/{bundle_id}/accept", post(accept))
        .route("/{bundle_id}/decline", post(decline))
}

#[derive(Debug, Serialize)]
pub struct ShareResponse {
    pub bundle_id: String,
    pub accepted: bool,
    pub failures: Vec<MemberFailure>,
}

async fn accept(
    state: State<Arc<AppState>>,
    identity: Extension<Identity>,
    bundle_id: Path<String>,
) -> Result<Json<ShareResponse>, AppError> {
    respond(state, identity, bundle_id, true).await
}

async fn decline(
    state: State<Arc<AppState>>,
    identity: Extension<Identity>,
    bundle_id: Path<String>,
) -> Result<Json<ShareResponse>, AppError> {
    respond(state, identity, bundle_id, false).await
}

async fn respond(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path(bundle_id): Path<String>,
    accept: bool,
) -> Result<Json<ShareResponse>, AppError> {
    validate_segment("bundle_id", &bundle_id)?;
    let update = state
        .access
        .respond_to_share(&identity.entity_id, &bundle_id, accept)
        .await?;
    Ok(Json(ShareResponse {
        bundle_id,
        accepted: accept,
        failures: update.failures,
    }))
}
