//! Error types shared by storage and intake operations.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the storage layer and the inbound accept path.
///
/// `InvalidArgument` and `NotFound` are surfaced to API callers. `Database`
/// never leaves the delivery engine; rounds log it and stop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Storage operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Required input was empty or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CoreError {
    /// Stable machine-readable code used in API error bodies.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "STORAGE_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested row not found".to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}
