//! Post-stream reconciliation
//!
//! After a session ends the emitted words are persisted as a request record
//! and charged against the user's quota. Each stage is attempted exactly once
//! under its own timeout; failures are logged and reported, never retried.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::timeout::StageTimeout;
use crate::metrics;
use crate::quota::{QuotaLedger, RequestRecord};
use crate::stream::SessionOutcome;

/// What reconciliation managed to commit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconciliationResult {
    pub record_saved: bool,
    pub record_id: Option<Uuid>,
    pub charged: bool,
    /// Committed quota after the charge
    pub words_left_after: Option<u64>,
}

/// Awaitable handle to a spawned reconciliation
#[derive(Debug)]
pub struct ReconciliationHandle {
    inner: JoinHandle<ReconciliationResult>,
}

impl ReconciliationHandle {
    pub(crate) fn new(inner: JoinHandle<ReconciliationResult>) -> Self {
        Self { inner }
    }

    /// Wait for the reconciliation task
    pub async fn wait(self) -> ReconciliationResult {
        match self.inner.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "Reconciliation task failed");
                ReconciliationResult::default()
            }
        }
    }
}

/// Persists and charges finished sessions
pub struct Reconciler {
    ledger: Arc<QuotaLedger>,
    timeout: StageTimeout,
}

impl Reconciler {
    pub fn new(ledger: Arc<QuotaLedger>, timeout: StageTimeout) -> Self {
        Self { ledger, timeout }
    }

    pub fn timeout(&self) -> StageTimeout {
        self.timeout
    }

    pub async fn reconcile(&self, outcome: &SessionOutcome) -> ReconciliationResult {
        let user_id = outcome.user_id.as_str();
        let mut result = ReconciliationResult::default();

        let record = RequestRecord::new(
            user_id,
            outcome.emitted_text(),
            outcome.token_count,
            outcome.wall_duration.as_secs_f64(),
        );

        let write_start = Instant::now();
        match self
            .timeout
            .run("persist request", self.ledger.record_request(&record))
            .await
        {
            Ok(()) => {
                metrics::DB_WRITE_DURATION_SECONDS.observe(write_start.elapsed().as_secs_f64());
                result.record_saved = true;
                result.record_id = Some(record.id);
            }
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to save request record");
            }
        }

        match self
            .timeout
            .run("charge quota", self.ledger.charge(user_id, outcome.token_count))
            .await
        {
            Ok(words_left) => {
                result.charged = true;
                result.words_left_after = Some(words_left);
            }
            Err(e) => {
                error!(
                    user_id = %user_id,
                    words = outcome.token_count,
                    error = %e,
                    "Failed to charge quota"
                );
            }
        }

        debug!(
            user_id = %user_id,
            record_saved = result.record_saved,
            charged = result.charged,
            "Reconciliation finished"
        );

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{
        LocalCache, MemoryStore, QuotaStore, StoreError, UserQuota, DEFAULT_WORD_QUOTA,
    };
    use crate::stream::TerminationReason;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Memory store with slow reads, to hold a user's cache fill open
    struct SlowReadStore(MemoryStore);

    #[async_trait]
    impl QuotaStore for SlowReadStore {
        async fn get_user(&self, user_id: &str) -> Result<Option<UserQuota>, StoreError> {
            tokio::time::sleep(Duration::from_secs(40)).await;
            self.0.get_user(user_id).await
        }
        async fn create_user(&self, user_id: &str, words_total: u64) -> Result<UserQuota, StoreError> {
            self.0.create_user(user_id, words_total).await
        }
        async fn charge(&self, user_id: &str, amount: u64) -> Result<UserQuota, StoreError> {
            self.0.charge(user_id, amount).await
        }
        async fn insert_request(&self, record: &RequestRecord) -> Result<(), StoreError> {
            self.0.insert_request(record).await
        }
        async fn requests_for(&self, user_id: &str) -> Result<Vec<RequestRecord>, StoreError> {
            self.0.requests_for(user_id).await
        }
        async fn delete_user(&self, user_id: &str) -> Result<bool, StoreError> {
            self.0.delete_user(user_id).await
        }
        async fn ping(&self) -> Result<(), StoreError> {
            self.0.ping().await
        }
    }

    fn outcome(user_id: &str, tokens: &[&str]) -> SessionOutcome {
        SessionOutcome {
            user_id: user_id.to_string(),
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            token_count: tokens.len() as u64,
            wall_duration: Duration::from_millis(1_500),
            termination: TerminationReason::MaxTokens,
        }
    }

    #[tokio::test]
    async fn test_reconcile_persists_and_charges() {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(QuotaLedger::new(store.clone(), Arc::new(LocalCache::default())));
        ledger.available("alice").await.unwrap();

        let reconciler = Reconciler::new(ledger, StageTimeout::default());
        let result = reconciler
            .reconcile(&outcome("alice", &["the", "be", "to"]))
            .await;

        assert!(result.record_saved && result.charged);
        assert_eq!(result.words_left_after, Some(DEFAULT_WORD_QUOTA - 3));

        let records = store.requests_for("alice").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, "the be to");
        assert_eq!(Some(records[0].id), result.record_id);
        assert!((records[0].duration_seconds - 1.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_reconcile_unknown_user_reports_failures() {
        let ledger = Arc::new(QuotaLedger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(LocalCache::default()),
        ));
        let reconciler = Reconciler::new(ledger, StageTimeout::default());

        let result = reconciler.reconcile(&outcome("ghost", &["a"])).await;
        assert_eq!(result, ReconciliationResult::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_charge_timeout_leaves_cache_consistent() {
        let store = Arc::new(SlowReadStore(MemoryStore::new()));
        store.0.insert_user(UserQuota::new("alice", 100));
        let ledger = Arc::new(QuotaLedger::new(store.clone(), Arc::new(LocalCache::default())));

        let reader = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.available("alice").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reconciler = Reconciler::new(Arc::clone(&ledger), StageTimeout::default());
        let result = reconciler.reconcile(&outcome("alice", &["a"; 10])).await;
        reader.await.unwrap().unwrap();

        let durable = store.0.get_user("alice").await.unwrap().unwrap().words_left;
        assert!(result.record_saved);
        assert_eq!(result.charged, durable == 90);
        assert!(!result.charged);
        assert!(ledger.available("alice").await.unwrap() <= durable);
    }
}
