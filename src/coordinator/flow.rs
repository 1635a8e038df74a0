//! Session Coordinator
//!
//! Handles one generation request end to end:
//! admission -> quota check -> stream -> reconcile.
//!
//! The pre-checks run in [`SessionCoordinator::begin`] and have no side
//! effects on failure. Streaming and reconciliation run in
//! [`AdmittedSession::stream`]. Spawned streams and their reconciliations
//! share one task tracker, so reconciliation completes even when the client
//! has gone away and [`SessionCoordinator::shutdown`] waits for both.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn, Instrument};

use super::reconcile::{ReconciliationHandle, Reconciler};
use super::timeout::StageTimeout;
use crate::error::MeteringError;
use crate::metrics;
use crate::quota::QuotaLedger;
use crate::rate_limit::RateLimiter;
use crate::stream::{SessionOutcome, StreamOptions, StreamSession, TokenSink};

/// Outcome of a streamed request plus its pending reconciliation
#[derive(Debug)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub reconciliation: ReconciliationHandle,
}

/// Composes the limiter, the ledger and the stream loop
#[derive(Clone)]
pub struct SessionCoordinator {
    limiter: Arc<RateLimiter>,
    ledger: Arc<QuotaLedger>,
    session: StreamSession,
    reconciler: Arc<Reconciler>,
    tracker: TaskTracker,
}

impl SessionCoordinator {
    pub fn new(
        limiter: Arc<RateLimiter>,
        ledger: Arc<QuotaLedger>,
        session: StreamSession,
        reconcile_timeout: StageTimeout,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&ledger), reconcile_timeout));
        Self {
            limiter,
            ledger,
            session,
            reconciler,
            tracker: TaskTracker::new(),
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    /// Admission and quota pre-checks
    pub async fn begin(
        &self,
        user_id: &str,
        options: StreamOptions,
    ) -> Result<AdmittedSession, MeteringError> {
        if user_id.is_empty() {
            return Err(MeteringError::Validation(
                "user id must not be empty".to_string(),
            ));
        }

        metrics::REQUESTS_TOTAL.inc();

        if !self.limiter.admit(user_id) {
            metrics::RATE_LIMIT_DROPPED_TOTAL.inc();
            info!(user_id = %user_id, "Request rejected by rate limiter");
            return Err(MeteringError::RateLimited);
        }

        let words_left = self.ledger.available(user_id).await.map_err(|e| {
            error!(user_id = %user_id, error = %e, "Failed to read quota");
            MeteringError::from(e)
        })?;

        if words_left == 0 {
            info!(user_id = %user_id, "Request rejected, quota exhausted");
            return Err(MeteringError::QuotaExhausted);
        }

        Ok(AdmittedSession {
            coordinator: self.clone(),
            user_id: user_id.to_string(),
            words_left,
            options,
        })
    }

    /// Run a full request: pre-checks, stream, then spawn reconciliation
    pub async fn handle(
        &self,
        user_id: &str,
        options: StreamOptions,
        sink: TokenSink,
        cancel: CancellationToken,
    ) -> Result<SessionReport, MeteringError> {
        let admitted = self.begin(user_id, options).await?;
        Ok(admitted.stream(sink, cancel).await)
    }

    /// Streams and reconciliations still running
    pub fn pending_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Wait up to `timeout` for outstanding streams and reconciliations, then
    /// stop the limiter sweep
    ///
    /// Returns `false` when tasks were still running at the timeout. A stream
    /// that ends after `close` still spawns its reconciliation on the tracker.
    /// Callers cancel open streams before waiting.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            info!(pending = pending, "Waiting for streams and reconciliations to finish");
        }

        let drained = tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                pending = self.tracker.len(),
                "Shutdown timed out with tasks outstanding"
            );
        }

        self.limiter.shutdown().await;
        drained
    }

    fn spawn_reconciliation(&self, outcome: SessionOutcome) -> ReconciliationHandle {
        let reconciler = Arc::clone(&self.reconciler);
        let handle = self
            .tracker
            .spawn(async move { reconciler.reconcile(&outcome).await });
        ReconciliationHandle::new(handle)
    }
}

/// A request that passed admission and the quota check
pub struct AdmittedSession {
    coordinator: SessionCoordinator,
    user_id: String,
    words_left: u64,
    options: StreamOptions,
}

impl AdmittedSession {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Quota observed at admission; bounds the stream
    pub fn words_left(&self) -> u64 {
        self.words_left
    }

    /// Stream to `sink` until a termination condition, then spawn reconciliation
    pub async fn stream(self, sink: TokenSink, cancel: CancellationToken) -> SessionReport {
        let outcome = {
            let _active = ActiveRequest::enter();
            self.coordinator
                .session
                .run(
                    &self.user_id,
                    self.words_left,
                    &self.options,
                    &sink,
                    &cancel,
                )
                .await
        };

        metrics::REQUEST_DURATION_SECONDS.observe(outcome.wall_duration.as_secs_f64());
        metrics::WORDS_GENERATED_TOTAL.inc_by(outcome.token_count);

        info!(
            user_id = %self.user_id,
            tokens = outcome.token_count,
            termination = %outcome.termination,
            duration_secs = outcome.wall_duration.as_secs_f64(),
            "Stream completed"
        );

        let reconciliation = self.coordinator.spawn_reconciliation(outcome.clone());
        SessionReport {
            outcome,
            reconciliation,
        }
    }

    /// Run [`stream`](Self::stream) on the coordinator's task tracker
    pub fn spawn(
        self,
        sink: TokenSink,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<SessionReport> {
        let tracker = self.coordinator.tracker.clone();
        tracker.spawn(self.stream(sink, cancel).in_current_span())
    }
}

/// Holds the in-flight gauge for the life of a stream
struct ActiveRequest;

impl ActiveRequest {
    fn enter() -> Self {
        metrics::ACTIVE_REQUESTS.inc();
        Self
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        metrics::ACTIVE_REQUESTS.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::{LocalCache, MemoryStore, QuotaStore, UserQuota};
    use crate::rate_limit::RateLimitConfig;
    use crate::stream::{Pacing, TerminationReason};

    fn coordinator(store: Arc<MemoryStore>, limit: u32) -> SessionCoordinator {
        let limiter = Arc::new(RateLimiter::without_sweep(RateLimitConfig {
            requests_per_window: limit,
            ..RateLimitConfig::default()
        }));
        let ledger = Arc::new(QuotaLedger::new(store, Arc::new(LocalCache::default())));
        SessionCoordinator::new(
            limiter,
            ledger,
            StreamSession::new(Pacing::immediate()),
            StageTimeout::default(),
        )
    }

    #[tokio::test]
    async fn test_empty_user_id_is_rejected() {
        let coordinator = coordinator(Arc::new(MemoryStore::new()), 10);
        let result = coordinator.begin("", StreamOptions::default()).await;
        assert!(matches!(result, Err(MeteringError::Validation(_))));
        assert_eq!(coordinator.limiter().tracked_users(), 0);
    }

    #[tokio::test]
    async fn test_begin_reports_words_left() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(UserQuota::new("alice", 10));
        let coordinator = coordinator(store, 10);

        let admitted = coordinator
            .begin("alice", StreamOptions::default())
            .await
            .unwrap();
        assert_eq!(admitted.words_left(), 10);
        assert_eq!(admitted.user_id(), "alice");
    }

    #[tokio::test]
    async fn test_handle_streams_and_reconciles() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(UserQuota::new("alice", 4));
        let coordinator = coordinator(store.clone(), 10);

        let (sink, _rx) = TokenSink::channel(16);
        let report = coordinator
            .handle(
                "alice",
                StreamOptions::default(),
                sink,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.outcome.termination, TerminationReason::QuotaExhausted);

        let result = report.reconciliation.wait().await;
        assert_eq!(result.words_left_after, Some(0));

        let second = coordinator.begin("alice", StreamOptions::default()).await;
        assert!(matches!(second, Err(MeteringError::QuotaExhausted)));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_reconciliation() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(store.clone(), 10);

        let (sink, _rx) = TokenSink::channel(16);
        let opts = StreamOptions {
            max_tokens: Some(2),
            ..StreamOptions::default()
        };
        let report = coordinator
            .handle("bob", opts, sink, CancellationToken::new())
            .await
            .unwrap();
        drop(report);

        assert!(coordinator.shutdown(Duration::from_secs(5)).await);
        assert_eq!(coordinator.pending_tasks(), 0);
        assert_eq!(store.requests_for("bob").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_spawned_stream() {
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(RateLimiter::without_sweep(RateLimitConfig::default()));
        let ledger = Arc::new(QuotaLedger::new(
            store.clone(),
            Arc::new(LocalCache::default()),
        ));
        let coordinator = SessionCoordinator::new(
            limiter,
            ledger,
            StreamSession::new(Pacing::default()),
            StageTimeout::default(),
        );

        let admitted = coordinator
            .begin("carol", StreamOptions::default())
            .await
            .unwrap();
        let (sink, mut rx) = TokenSink::channel(16);
        let _task = admitted.spawn(sink, CancellationToken::new());
        assert!(coordinator.pending_tasks() >= 1);

        // Client goes away after the first token, while shutdown is starting
        assert!(rx.recv().await.is_some());
        drop(rx);

        assert!(coordinator.shutdown(Duration::from_secs(5)).await);
        assert_eq!(coordinator.pending_tasks(), 0);
        assert_eq!(store.requests_for("carol").await.unwrap().len(), 1);
    }
}
