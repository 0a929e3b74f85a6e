//! API error responses.
//!
//! Every failure is rendered as `{"error": {"code": ..., "message": ...}}`
//! with a status derived from the underlying [`CoreError`]. Malformed path
//! parameters get the same shape as `INVALID_ARGUMENT`.

use axum::{
    extract::rejection::PathRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::CoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

/// Error returned by API handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Error from the intake path or storage.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Path parameter that does not parse, such as a non-numeric id.
    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathRejection),
}

/// Error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Stable error code: `INVALID_ARGUMENT`, `NOT_FOUND` or `STORAGE_ERROR`
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

impl ApiError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Core(CoreError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
            Self::Core(CoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Core(CoreError::Database(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidPath(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn detail(&self) -> ErrorDetail {
        match self {
            Self::Core(core) => {
                let message = match core {
                    CoreError::InvalidArgument(message) | CoreError::NotFound(message) => {
                        message.clone()
                    },
                    CoreError::Database(_) => "storage unavailable".to_string(),
                };
                ErrorDetail { code: core.code().to_string(), message }
            },
            Self::InvalidPath(rejection) => ErrorDetail {
                code: "INVALID_ARGUMENT".to_string(),
                message: rejection.body_text(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }

        (status, Json(ErrorResponse { error: self.detail() })).into_response()
    }
}
