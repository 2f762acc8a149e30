//! # Broker Error Types
//!
//! Structured error handling for the broker using thiserror. Storage errors are
//! split into transient and non-transient variants so the consumer loop can tell
//! a dropped connection apart from a genuine failure.

use thiserror::Error;

/// Errors raised by broker operations
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Connection-level failure that may succeed on retry
    #[error("Storage unavailable during {operation}: {message}")]
    StorageUnavailable { operation: String, message: String },

    /// Database error that retrying will not fix
    #[error("Storage error during {operation}: {source}")]
    Storage {
        operation: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Invalid queue name: {queue_name}: {reason}")]
    InvalidQueueName { queue_name: String, reason: String },

    #[error("Invalid message id: {message_id}: {reason}")]
    InvalidMessageId { message_id: String, reason: String },

    #[error("Invalid delay of {delay:?}: {reason}")]
    InvalidDelay {
        delay: std::time::Duration,
        reason: String,
    },

    #[error("Notification payload too large: {size_bytes} bytes exceeds limit of {limit_bytes} bytes")]
    PayloadTooLarge {
        size_bytes: usize,
        limit_bytes: usize,
    },

    /// A stored row could not be mapped back to a message
    #[error("Corrupt row for message {message_id}: {message}")]
    CorruptRow { message_id: String, message: String },

    #[error("Notification channel {channel} lost after {attempts} reconnection attempts")]
    ReconnectExhausted { channel: String, attempts: u32 },

    #[error("Background task failed: {message}")]
    TaskFailed { message: String },
}

impl BrokerError {
    /// Classify a sqlx error raised while performing `operation`
    pub fn storage(operation: impl Into<String>, err: sqlx::Error) -> Self {
        let operation = operation.into();
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::StorageUnavailable {
                operation,
                message: err.to_string(),
            },
            other => Self::Storage {
                operation,
                source: other,
            },
        }
    }

    /// Create a transient unavailability error
    pub fn unavailable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::StorageUnavailable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid queue name error
    pub fn invalid_queue_name(queue_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueueName {
            queue_name: queue_name.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid message id error
    pub fn invalid_message_id(message_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMessageId {
            message_id: message_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a corrupt row error
    pub fn corrupt_row(message_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CorruptRow {
            message_id: message_id.into(),
            message: message.into(),
        }
    }

    /// Whether the error is a connectivity problem that a retry may resolve
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(err: sqlx::Error) -> Self {
        Self::storage("query", err)
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(err: config::ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;
