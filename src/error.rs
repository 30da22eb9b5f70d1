//! Error types for the flash-sale service

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache and order pipeline.
///
/// Admission rejections (out of stock, duplicate purchase, sale window) are
/// not errors; they are reported through [`crate::seckill::AdmissionResult`].
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed caller input
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Key-value store unreachable or refused the command
    #[error("Key-value store error: {0}")]
    Store(String),

    /// Redis client error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Backing relational store failure
    #[error("Repository error: {0}")]
    Repository(String),

    /// Cached payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Admission succeeded but the order queue had no room
    #[error("Order queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The pipeline no longer accepts work
    #[error("Order pipeline is shutting down")]
    ShuttingDown,

    /// A lock could not be obtained within the retry budget
    #[error("Lock {key} still held after {attempts} attempts")]
    LockContention { key: String, attempts: u32 },

    /// The store answered a script with a code we do not understand
    #[error("Unexpected admission script result: {0}")]
    UnexpectedScriptResult(i64),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for failures of an external dependency that may clear up on
    /// their own (store or database unreachable).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Store(_) | Error::Redis(_) | Error::Repository(_) | Error::QueueFull { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Store("down".into()).is_transient());
        assert!(Error::QueueFull { capacity: 4 }.is_transient());
        assert!(!Error::Validation("bad id".into()).is_transient());
        assert!(!Error::ShuttingDown.is_transient());
    }

    #[test]
    fn test_display() {
        let err = Error::LockContention {
            key: "lock:shop:1".into(),
            attempts: 3,
        };
        assert_eq!(err.to_string(), "Lock lock:shop:1 still held after 3 attempts");
    }
}
