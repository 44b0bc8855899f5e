//! HTTP routes.
//!
//! Everything under `/v1` except the health probe requires the host to
//! forward a caller identity (see [`crate::middleware`]).

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router, middleware as axum_mw};
use serde_json::{Value, json};

use crate::error::AppError;
use crate::middleware::identity_middleware;
use crate::state::AppState;

pub mod bundles;
pub mod register;
pub mod shared;
pub mod sys;
pub mod users;

const MAX_CONCURRENT_BUNDLE_REQUESTS: usize = 64;

/// Build the API router without transport layers.
pub fn router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .nest("/v1/register", register::router())
        .nest("/v1/users", users::router())
        // Member updates fan out to every member's index and policy.
        .nest(
            "/v1/bundles",
            bundles::router().layer(tower::limit::ConcurrencyLimitLayer::new(
                MAX_CONCURRENT_BUNDLE_REQUESTS,
            )),
        )
        .nest("/v1/shared", shared::router())
        .nest("/v1/policy", sys::router())
        .route_layer(axum_mw::from_fn(identity_middleware));

    Router::new()
        .route("/v1/health", get(health))
        .merge(authenticated)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Reject a path segment that cannot name an entity or bundle.
pub(crate) fn validate_segment(field: &str, value: &str) -> Result<(), AppError> {
    if value.is_empty() || value.len() > 128 {
        return Err(AppError::BadRequest(format!(
            "{field} must be between 1 and 128 characters"
        )));
    }
    if !value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(AppError::BadRequest(format!(
            "{field} may only contain alphanumeric characters, '-' and '_'"
        )));
    }
    Ok(())
}
