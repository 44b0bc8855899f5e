//! Public key lookup: `/v1/users/{entity_name}/pubkey`

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use keyshelf_core::jwk::PublicJwk;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/{entity_name}/pubkey", get(public_key))
}

#[derive(Debug, Serialize)]
pub struct PublicKeyResponse {
    pub entity_id: String,
    pub entity_name: String,
    pub pub_key: PublicJwk,
}

async fn public_key(
    State(state): State<Arc<AppState>>,
    Path(entity_name): Path<String>,
) -> Result<Json<PublicKeyResponse>, AppError> {
    let entity_id = state.users.resolve_entity_id(&entity_name).await?;
    let pub_key = state.users.public_key(&entity_id).await?;
    Ok(Json(PublicKeyResponse {
        entity_id,
        entity_name,
        pub_key,
    }))
}
