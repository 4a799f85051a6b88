//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service and how it is
//! rendered as an HTTP response.

use crate::config::ConfigError;
use crate::web::state::AppState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use coupon_book_core::ports::PortError;
use serde::Serialize;
use std::sync::Arc;
use tracing::error;
use utoipa::ToSchema;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("{0}")]
    Port(#[from] PortError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache Error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

/// Body of every error response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Port(e) => StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            ApiError::Port(PortError::Unexpected(detail)) => ErrorBody {
                error: "internal".to_string(),
                message: "An unexpected error occurred".to_string(),
                details: Some(detail.clone()),
            },
            ApiError::Port(e) => ErrorBody {
                error: e.kind().to_string(),
                message: e.to_string(),
                details: None,
            },
            other => ErrorBody {
                error: "internal".to_string(),
                message: "Internal server error".to_string(),
                details: Some(other.to_string()),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = self.body();
        let mut response = (status, Json(body.clone())).into_response();
        // Kept on the response so `redact_error_details` can re-render it.
        response.extensions_mut().insert(body);
        response
    }
}

/// Router layer that strips `details` from error bodies when the state asks
/// for it.
pub async fn redact_error_details(
    State(state): State<Arc<AppState>>,
    mut response: Response,
) -> Response {
    let Some(mut body) = response.extensions_mut().remove::<ErrorBody>() else {
        return response;
    };
    if !state.hide_error_details || body.details.is_none() {
        return response;
    }
    body.details = None;
    (response.status(), Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_errors_keep_their_status_and_kind() {
        let err = ApiError::from(PortError::Forbidden("limit".to_string()));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        let body = err.body();
        assert_eq!(body.error, "forbidden");
        assert_eq!(body.message, "limit");
        assert!(body.details.is_none());
    }

    #[test]
    fn unexpected_errors_carry_details() {
        let err = ApiError::from(PortError::Unexpected("pool timed out".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.body().details.as_deref(), Some("pool timed out"));
    }

    #[test]
    fn rendered_errors_keep_their_body_for_redaction() {
        let response = ApiError::Internal("disk full".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = response.extensions().get::<ErrorBody>().unwrap();
        assert_eq!(body.details.as_deref(), Some("An unexpected internal error occurred: disk full"));
    }
}
