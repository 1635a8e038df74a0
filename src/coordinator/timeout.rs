//! Stage Timeout Management
//!
//! Bounds each reconciliation stage with its own deadline, independent of the
//! request that produced the work.

use std::future::Future;
use std::time::Duration;
use tokio::time;

use crate::error::ReconciliationError;
use crate::quota::LedgerError;

/// Timeout for one reconciliation stage
#[derive(Debug, Clone, Copy)]
pub struct StageTimeout {
    /// The timeout duration
    duration: Duration,
}

impl Default for StageTimeout {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl StageTimeout {
    /// Create a new stage timeout
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use wordmeter::coordinator::StageTimeout;
    ///
    /// let timeout = StageTimeout::new(Duration::from_secs(5));
    /// assert_eq!(timeout.duration(), Duration::from_secs(5));
    /// ```
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    /// Get the timeout duration
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Create a timeout from seconds
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Run a ledger call, labelling any failure with `stage`
    pub async fn run<F, T>(&self, stage: &'static str, future: F) -> Result<T, ReconciliationError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        match time::timeout(self.duration, future).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ReconciliationError::Ledger { stage, source }),
            Err(_) => Err(ReconciliationError::Timeout {
                stage,
                elapsed: self.duration,
            }),
        }
    }
}
