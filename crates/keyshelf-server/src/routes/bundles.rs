//! Bundle routes: `/v1/bundles/*`
//!
//! Creation, listing, membership updates and deletion. The membership
//! response carries the members' public keys so the caller can wrap the
//! bundle key for each recipient.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;

use keyshelf_core::jwk::PublicJwk;
use keyshelf_core::{Bundle, MemberFailure, MemberUpdateRequest, SharedBundle};

use crate::error::AppError;
use crate::middleware::Identity;
use crate::routes::validate_segment;
use crate::state::AppState;

/// Build the `/v1/bundles` router.
///
/// - `GET    /v1/bundles`: owned and shared bundles
/// - `POST   /v1/bundles`: create a bundle
/// - `POST   /v1/bundles/{owner}/{bundle_id}/users`: replace the member list
/// - `DELETE /v1/bundles/{owner}/{bundle_id}`: delete a bundle
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_bundles).post(create_bundle))
        .route("/{owner}/{bundle_id}/users", post(update_members))
        .route("/{owner}/{bundle_id}", delete(delete_bundle))
}

// ── Response types ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct BundleListResponse {
    pub bundles: Vec<Bundle>,
    pub shared_bundles: Vec<SharedBundle>,
}

#[derive(Debug, Serialize)]
pub struct CreateBundleResponse {
    pub bundle: Bundle,
    pub bundles: Vec<Bundle>,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct MembersResponse {
    pub pubkey: BTreeMap<String, PublicJwk>,
    pub failures: Vec<MemberFailure>,
}

#[derive(Debug, Serialize)]
pub struct DeleteResponse {
    pub failures: Vec<MemberFailure>,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn list_bundles(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<BundleListResponse>, AppError> {
    let bundles = state.bundles.list(&identity.entity_id).await?;
    let shared_bundles = state.bundles.list_shared(&identity.entity_id).await?;
    Ok(Json(BundleListResponse {
        bundles,
        shared_bundles,
    }))
}

async fn create_bundle(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<CreateBundleResponse>, AppError> {
    let bundle = state.bundles.create(&identity.entity_id).await?;
    let bundles = state.bundles.list(&identity.entity_id).await?;
    Ok(Json(CreateBundleResponse {
        path: bundle.path.clone(),
        bundle,
        bundles,
    }))
}

async fn update_members(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path((owner, bundle_id)): Path<(String, String)>,
    Json(request): Json<MemberUpdateRequest>,
) -> Result<Json<MembersResponse>, AppError> {
    validate_segment("owner", &owner)?;
    validate_segment("bundle_id", &bundle_id)?;

    let update = state
        .access
        .update_members(&owner, &bundle_id, &identity.entity_id, &request)
        .await?;
    Ok(Json(MembersResponse {
        pubkey: update.public_keys,
        failures: update.failures,
    }))
}

async fn delete_bundle(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Path((owner, bundle_id)): Path<(String, String)>,
) -> Result<Json<DeleteResponse>, AppError> {
    validate_segment("owner", &owner)?;
    validate_segment("bundle_id", &bundle_id)?;

    let failures = state
        .access
        .delete_bundle(&owner, &bundle_id, &identity.entity_id)
        .await?;
    Ok(Json(DeleteResponse { failures }))
}
