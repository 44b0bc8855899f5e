//! Unlock key registration: `/v1/register`
//!
//! The client builds its UUK locally and uploads only the sealed envelope
//! and public key. Registration happens once per entity.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json, Router};

use keyshelf_core::Uuk;

use crate::error::AppError;
use crate::middleware::Identity;
use crate::state::AppState;

/// Build the `/v1/register` router.
///
/// - `POST /v1/register`: register the caller's UUK
/// - `GET  /v1/register`: fetch the caller's UUK to unlock it client-side
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_uuk).post(register))
}

async fn register(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
    Json(uuk): Json<Uuk>,
) -> Result<StatusCode, AppError> {
    let name = identity.require_name()?;
    state
        .users
        .register(&identity.entity_id, name, uuk)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_uuk(
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Uuk>, AppError> {
    let entry = state.users.get(&identity.entity_id).await?;
    Ok(Json(entry.uuk))
}
