//! Caller identity middleware.
//!
//! The host in front of this server authenticates every request and
//! forwards the caller's entity id and display name in headers. This layer
//! lifts them into an [`Identity`] request extension; requests without an
//! entity id never reach a handler.

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::AppError;

/// Header carrying the authenticated entity id.
pub const ENTITY_ID_HEADER: &str = "x-entity-id";

/// Header carrying the caller's display name.
pub const ENTITY_NAME_HEADER: &str = "x-entity-name";

/// The authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub entity_id: String,
    /// Needed only for registration.
    pub entity_name: Option<String>,
}

impl Identity {
    /// The caller's display name.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::BadRequest`] if the host did not forward one.
    pub fn require_name(&self) -> Result<&str, AppError> {
        self.entity_name
            .as_deref()
            .ok_or_else(|| AppError::BadRequest(format!("missing {ENTITY_NAME_HEADER} header")))
    }
}

/// Reject the request unless the host supplied an entity id.
///
/// # Errors
///
/// Returns [`AppError::Unauthorized`] for a missing or blank entity id.
pub async fn identity_middleware(mut req: Request, next: Next) -> Result<Response, AppError> {
    let identity = identity_from_headers(req.headers())?;
    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

fn identity_from_headers(headers: &HeaderMap) -> Result<Identity, AppError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_owned)
    };

    let entity_id = header(ENTITY_ID_HEADER)
        .ok_or_else(|| AppError::Unauthorized(format!("missing {ENTITY_ID_HEADER} header")))?;
    Ok(Identity {
        entity_id,
        entity_name: header(ENTITY_NAME_HEADER),
    })
}
