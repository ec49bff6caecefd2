//! Error types for the Tiergate rate limiting engine.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tiergate operations.
#[derive(Error, Debug)]
pub enum TiergateError {
    /// Configuration-related errors. These are fatal at initialization.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic storage backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Distributed cache errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Relational store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A backend call did not complete within the configured bound
    #[error("Storage operation timed out after {0:?}")]
    Timeout(Duration),

    /// Serialization errors for stored records
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TiergateError {
    /// Whether this error means the backend is unreachable rather than
    /// misbehaving on an established connection.
    pub fn is_unavailable(&self) -> bool {
        match self {
            TiergateError::Timeout(_) => true,
            TiergateError::Redis(e) => {
                e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() || e.is_io_error()
            }
            TiergateError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            TiergateError::Io(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for Tiergate operations.
pub type Result<T> = std::result::Result<T, TiergateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_unavailable() {
        let err = TiergateError::Timeout(Duration::from_millis(500));
        assert!(err.is_unavailable());
        assert_eq!(err.to_string(), "Storage operation timed out after 500ms");
    }

    #[test]
    fn test_config_is_not_unavailable() {
        let err = TiergateError::Config("unknown storage".to_string());
        assert!(!err.is_unavailable());
    }
}
