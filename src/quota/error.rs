//! Quota Error Types
//!
//! Errors raised by the durable store, the quota cache and the ledger that
//! composes them.

/// Errors from the durable quota store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The user row does not exist
    #[error("User not found: {0}")]
    UserNotFound(String),

    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded
    #[error("Corrupt record for {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    /// Request record (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend returned an error
    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Errors from the quota cache
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The cache could not be reached
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// A cached value could not be decoded
    #[error("Invalid cache entry: {0}")]
    InvalidEntry(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Unavailable(err.to_string())
    }
}

/// Errors surfaced by the quota ledger
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Durable store failure
    #[error(transparent)]
    Store(#[from] StoreError),
}
