//! HTTP error type for saxscore-worker

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::transpose::TransposeError;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409), e.g. re-admitting a job that is still running
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Analysis backend failed while serving the request (502)
    #[error("Analysis backend failed: {0}")]
    Backend(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// saxscore-common error
    #[error("Common error: {0}")]
    Common(saxscore_common::Error),
}

impl From<saxscore_common::Error> for ApiError {
    fn from(err: saxscore_common::Error) -> Self {
        use saxscore_common::Error;
        match err {
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            Error::Conflict(msg) => ApiError::Conflict(msg),
            Error::Internal(msg) => ApiError::Internal(msg),
            other => ApiError::Common(other),
        }
    }
}

impl From<TransposeError> for ApiError {
    fn from(err: TransposeError) -> Self {
        match err {
            TransposeError::JobNotFound(id) => ApiError::NotFound(format!("job {}", id)),
            TransposeError::NoNotes(_) => ApiError::BadRequest(err.to_string()),
            TransposeError::Backend(e) => ApiError::Backend(e.to_string()),
            TransposeError::Store(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Backend(msg) => (StatusCode::BAD_GATEWAY, "BACKEND_ERROR", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Common(ref err) => {
                tracing::error!(error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "COMMON_ERROR", err.to_string())
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
