//! Error types for delivery operations.
//!
//! Every variant that can arise during a round is absorbed at the round
//! boundary: it is logged, may flip the destination offline, and halts the
//! round, but never reaches the caller of `process_destination`.

use std::{fmt, time::Duration};

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors raised by the delivery client, the engine and the service
/// lifecycle.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Transport-level failure: connection refused, DNS, TLS, reset.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// Request exceeded the client timeout.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Configured request timeout
        timeout_seconds: u64,
    },

    /// Destination answered with anything other than 200.
    #[error("unexpected response: HTTP {status_code}")]
    UnexpectedStatus {
        /// HTTP status code returned by the destination
        status_code: u16,
        /// Response body, truncated
        body: String,
    },

    /// Backlog or directory operation failed mid-round.
    #[error("storage error: {message}")]
    StorageError {
        /// Storage error message
        message: String,
    },

    /// Invalid client or schedule configuration.
    #[error("invalid delivery configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Background tasks did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// A background task panicked.
    #[error("{task} task panicked: {error}")]
    TaskPanic {
        /// Name of the task
        task: &'static str,
        /// Join error detail
        error: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an error for a non-200 response.
    pub fn unexpected_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::UnexpectedStatus { status_code, body: body.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Whether this error counts as a failed delivery attempt.
    ///
    /// Network and application level failures are treated alike: both flip
    /// the destination offline and leave the message queued.
    pub fn is_delivery_failure(&self) -> bool {
        matches!(
            self,
            Self::NetworkError { .. } | Self::Timeout { .. } | Self::UnexpectedStatus { .. }
        )
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        Self::storage(error.to_string())
    }
}

/// Category of delivery error, used as a structured log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transport failures and timeouts.
    Network,
    /// Non-200 responses.
    Status,
    /// Storage failures.
    Storage,
    /// Configuration problems.
    Configuration,
    /// Lifecycle failures.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::UnexpectedStatus { .. } => Self::Status,
            DeliveryError::StorageError { .. } => Self::Storage,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownTimeout { .. } | DeliveryError::TaskPanic { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Status => write!(f, "status"),
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
