//! Error types for webhook delivery operations.
//!
//! Delivery outcomes themselves (a 500 from the receiver, a refused
//! connection) are not errors here; they are recorded as attempts and drive
//! the retry policy. These errors cover the pipeline's own failures: bad
//! input, unreachable storage or queue, and lifecycle problems.

use std::{fmt, time::Duration};

use courier_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions raised by the delivery pipeline.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// The message cannot be turned into an HTTP request.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong with the request
        message: String,
    },

    /// Message store operation failed.
    #[error("database error: {message}")]
    DatabaseError {
        /// Database error message
        message: String,
    },

    /// Work queue operation failed.
    #[error("queue error: {message}")]
    QueueError {
        /// Queue error message
        message: String,
    },

    /// Invalid engine or client configuration.
    #[error("configuration error: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// Tasks did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },

    /// A supervised task panicked.
    #[error("task {task} panicked: {error}")]
    WorkerPanic {
        /// Task label, e.g. `worker-0` or `scheduler`
        task: String,
        /// Join error description
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

    /// Creates an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::DatabaseError { message: message.into() }
    }

    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::QueueError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Whether retrying the same operation later could succeed.
    ///
    /// Infrastructure hiccups are retryable; bad input and lifecycle errors
    /// are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::Timeout { .. }
            | Self::DatabaseError { .. }
            | Self::QueueError { .. } => true,

            Self::InvalidRequest { .. }
            | Self::ConfigurationError { .. }
            | Self::ShutdownTimeout { .. }
            | Self::WorkerPanic { .. } => false,
        }
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidInput(message) => Self::InvalidRequest { message },
            other => Self::DatabaseError { message: other.to_string() },
        }
    }
}

/// Category of delivery error for metrics and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network connectivity issues.
    Network,
    /// Rejected input.
    Request,
    /// Message store operations.
    Database,
    /// Work queue operations.
    Queue,
    /// Configuration problems.
    Configuration,
    /// Task lifecycle errors.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::InvalidRequest { .. } => Self::Request,
            DeliveryError::DatabaseError { .. } => Self::Database,
            DeliveryError::QueueError { .. } => Self::Queue,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShutdownTimeout { .. } | DeliveryError::WorkerPanic { .. } => {
                Self::Internal
            },
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Request => write!(f, "request"),
            Self::Database => write!(f, "database"),
            Self::Queue => write!(f, "queue"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_identified_correctly() {
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(DeliveryError::timeout(10).is_retryable());
        assert!(DeliveryError::database("connection lost").is_retryable());
        assert!(DeliveryError::queue("pop failed").is_retryable());

        assert!(!DeliveryError::invalid_request("bad method").is_retryable());
        assert!(!DeliveryError::configuration("invalid URL").is_retryable());
        assert!(!DeliveryError::ShutdownTimeout { timeout: Duration::from_secs(1) }.is_retryable());
    }

    #[test]
    fn core_errors_convert_by_kind() {
        let invalid = DeliveryError::from(CoreError::InvalidInput("status".to_string()));
        assert!(matches!(invalid, DeliveryError::InvalidRequest { .. }));

        let missing = DeliveryError::from(CoreError::NotFound("message".to_string()));
        assert!(matches!(missing, DeliveryError::DatabaseError { .. }));
    }

    #[test]
    fn categories_display_as_metric_labels() {
        assert_eq!(ErrorCategory::from(&DeliveryError::timeout(10)).to_string(), "network");
        assert_eq!(ErrorCategory::from(&DeliveryError::queue("x")).to_string(), "queue");
        assert_eq!(
            ErrorCategory::from(&DeliveryError::invalid_request("x")).to_string(),
            "request"
        );
    }
}
