//! Error Types
//!
//! Request-level errors returned before any token is emitted, and the
//! reconciliation errors that are only ever logged.

use std::time::Duration;

use crate::quota::LedgerError;

/// Errors that abort a generation request with no side effects
#[derive(Debug, thiserror::Error)]
pub enum MeteringError {
    /// Malformed or missing request input
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Per-user request rate exceeded
    #[error("Rate limit exceeded")]
    RateLimited,

    /// No words left in the user's quota
    #[error("No words left")]
    QuotaExhausted,

    /// Quota could not be read
    #[error("Quota lookup failed: {0}")]
    Dependency(#[from] LedgerError),
}

impl MeteringError {
    /// HTTP status for this error
    pub fn status_code(&self) -> u16 {
        match self {
            MeteringError::Validation(_) => 400,
            MeteringError::RateLimited => 429,
            MeteringError::QuotaExhausted => 403,
            MeteringError::Dependency(_) => 500,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            MeteringError::Validation(_) => "invalid_request",
            MeteringError::RateLimited => "rate_limited",
            MeteringError::QuotaExhausted => "quota_exhausted",
            MeteringError::Dependency(_) => "dependency_failure",
        }
    }
}

/// Failure of one reconciliation stage
#[derive(Debug, thiserror::Error)]
pub enum ReconciliationError {
    /// The stage did not finish within the reconciliation timeout
    #[error("{stage} timed out after {elapsed:?}")]
    Timeout {
        stage: &'static str,
        elapsed: Duration,
    },

    /// The ledger rejected the write
    #[error("{stage} failed: {source}")]
    Ledger {
        stage: &'static str,
        #[source]
        source: LedgerError,
    },
}
