//! HTTP error types for the keyshelf server.
//!
//! Maps domain errors from `keyshelf-core` into HTTP responses. Every error
//! variant produces a JSON body with a machine-readable `error` field and a
//! human-readable `message`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use keyshelf_core::{BundleError, UserError};

/// Application-level error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// No caller identity was forwarded by the host.
    Unauthorized(String),
    /// The caller may not perform the operation.
    Forbidden(String),
    /// Requested resource not found.
    NotFound(String),
    /// Client sent invalid input.
    BadRequest(String),
    /// The resource already exists.
    Conflict(String),
    /// A lock could not be acquired in time.
    Unavailable(String),
    /// Internal server error.
    Internal(String),
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, "forbidden", msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable", msg),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg),
        };

        let body = ErrorBody {
            error: error_type,
            message,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl From<UserError> for AppError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::AlreadyRegistered { .. } | UserError::NameTaken { .. } => {
                Self::Conflict(err.to_string())
            }
            UserError::NotFound { .. } | UserError::UnknownName { .. } => {
                Self::NotFound(err.to_string())
            }
            UserError::InvalidIdentity { .. } | UserError::Invalid(_) => {
                Self::BadRequest(err.to_string())
            }
            UserError::LockTimeout { .. } => Self::Unavailable(err.to_string()),
            UserError::Serialization { .. } | UserError::Storage(_) => {
                Self::Internal(err.to_string())
            }
        }
    }
}

impl From<BundleError> for AppError {
    fn from(err: BundleError) -> Self {
        match err {
            BundleError::NotFound | BundleError::NotShared { .. } => {
                Self::NotFound(err.to_string())
            }
            BundleError::NotAuthorized => Self::Forbidden(err.to_string()),
            BundleError::Lookup { .. } | BundleError::InvalidRequest { .. } => {
                Self::BadRequest(err.to_string())
            }
            BundleError::LockTimeout { .. } => Self::Unavailable(err.to_string()),
            BundleError::Incomplete { .. }
            | BundleError::Serialization { .. }
            | BundleError::Policy(_)
            | BundleError::Storage(_) => Self::Internal(err.to_string()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn status(err: impl Into<AppError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn bundle_errors_map_to_statuses() {
        assert_eq!(status(BundleError::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status(BundleError::NotAuthorized), StatusCode::FORBIDDEN);
        assert_eq!(
            status(BundleError::Lookup {
                entity_name: "bob".into(),
                reason: "unregistered".into()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(BundleError::LockTimeout { path: "p".into() }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(BundleError::Incomplete { failures: vec![] }),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn user_errors_map_to_statuses() {
        assert_eq!(
            status(UserError::AlreadyRegistered {
                entity_id: "e".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(UserError::UnknownName {
                entity_name: "n".into()
            }),
            StatusCode::NOT_FOUND
        );
    }
}
