//! Quota Ledger
//!
//! Read-through cache in front of the durable store. The ledger is the only
//! writer of `words_left`, and it owns the consistency rule between the two:
//! a cached value may be stale but never higher than the durable value.
//!
//! A cache miss holds a per-user fill lock across its store read and cache
//! write. `charge` takes the same lock before it commits and keeps it until
//! the cache entry is gone, so a slow fill can never re-publish a value read
//! before the charge. The invalidation runs on its own task: once the store
//! has committed, dropping the caller's future cannot skip it.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use super::cache::{QuotaCache, DEFAULT_CACHE_TTL};
use super::error::LedgerError;
use super::store::QuotaStore;
use super::types::{HealthReport, QuotaSnapshot, QuotaStats, RequestRecord, DEFAULT_WORD_QUOTA};
use crate::metrics;

/// Ledger tuning
#[derive(Debug, Clone, Copy)]
pub struct LedgerSettings {
    /// Allowance for a newly seen user
    pub default_words: u64,
    /// Lifetime of a cache entry
    pub cache_ttl: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            default_words: DEFAULT_WORD_QUOTA,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// Per-user word quota backed by a durable store and a TTL cache
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    cache: Arc<dyn QuotaCache>,
    settings: LedgerSettings,
    fill_locks: Arc<FillLocks>,
}

type FillLocks = DashMap<String, Arc<Mutex<()>>>;

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, cache: Arc<dyn QuotaCache>) -> Self {
        Self::with_settings(store, cache, LedgerSettings::default())
    }

    pub fn with_settings(
        store: Arc<dyn QuotaStore>,
        cache: Arc<dyn QuotaCache>,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            store,
            cache,
            settings,
            fill_locks: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    /// Remaining words for a user, creating the user on first reference
    pub async fn available(&self, user_id: &str) -> Result<u64, LedgerError> {
        Ok(self.snapshot(user_id).await?.words_left)
    }

    /// Decrement a user's quota by `amount`, saturating at zero
    ///
    /// Returns the committed `words_left`. A failed charge leaves the store
    /// and the cache untouched. Cancelling the call can only abandon it before
    /// the commit; after the commit the cache entry is always invalidated.
    pub async fn charge(&self, user_id: &str, amount: u64) -> Result<u64, LedgerError> {
        let guard = self.fill_lock(user_id).lock_owned().await;

        let committed = match self.store.charge(user_id, amount).await {
            Ok(row) => row,
            Err(e) => {
                drop(guard);
                release_fill_lock(&self.fill_locks, user_id);
                return Err(e.into());
            }
        };

        let invalidation = tokio::spawn(invalidate_locked(
            Arc::clone(&self.cache),
            Arc::clone(&self.fill_locks),
            user_id.to_string(),
            guard,
        ));
        if let Err(e) = invalidation.await {
            error!(user_id = %user_id, error = %e, "Quota cache invalidation task failed");
        }

        debug!(
            user_id = %user_id,
            amount = amount,
            words_left = committed.words_left,
            "Quota charged"
        );
        Ok(committed.words_left)
    }

    /// Quota inspection, served through the same read-through path
    pub async fn stats(&self, user_id: &str) -> Result<QuotaStats, LedgerError> {
        let snapshot = self.snapshot(user_id).await?;
        Ok(QuotaStats::from_snapshot(user_id, snapshot))
    }

    /// Persist an immutable request record
    pub async fn record_request(&self, record: &RequestRecord) -> Result<(), LedgerError> {
        self.store.insert_request(record).await?;
        Ok(())
    }

    /// Probe both dependencies
    pub async fn health(&self) -> HealthReport {
        let store_ok = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Quota store health check failed");
                false
            }
        };
        let cache_ok = match self.cache.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Quota cache health check failed");
                false
            }
        };
        HealthReport::from_checks(store_ok, cache_ok)
    }

    async fn snapshot(&self, user_id: &str) -> Result<QuotaSnapshot, LedgerError> {
        if let Some(hit) = self.cached(user_id).await {
            metrics::QUOTA_CACHE_HITS_TOTAL.inc();
            return Ok(hit);
        }
        metrics::QUOTA_CACHE_MISSES_TOTAL.inc();

        let result = {
            let lock = self.fill_lock(user_id);
            let _guard = lock.lock().await;
            self.fill(user_id).await
        };
        release_fill_lock(&self.fill_locks, user_id);
        result
    }

    async fn cached(&self, user_id: &str) -> Option<QuotaSnapshot> {
        match self.cache.get(user_id).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Quota cache read failed, using store");
                None
            }
        }
    }

    /// Miss path; caller holds the user's fill lock
    async fn fill(&self, user_id: &str) -> Result<QuotaSnapshot, LedgerError> {
        let row = match self.store.get_user(user_id).await? {
            Some(row) => row,
            None => {
                let row = self
                    .store
                    .create_user(user_id, self.settings.default_words)
                    .await?;
                info!(user_id = %user_id, words_total = row.words_total, "Created user quota");
                row
            }
        };

        let snapshot = row.snapshot();
        if let Err(e) = self
            .cache
            .set(user_id, snapshot, self.settings.cache_ttl)
            .await
        {
            warn!(user_id = %user_id, error = %e, "Failed to populate quota cache");
        }
        Ok(snapshot)
    }

    fn fill_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.fill_locks
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }
}

/// Drop a user's cache entry, then give up the fill lock held since the commit
async fn invalidate_locked(
    cache: Arc<dyn QuotaCache>,
    locks: Arc<FillLocks>,
    user_id: String,
    guard: OwnedMutexGuard<()>,
) {
    if let Err(e) = cache.invalidate(&user_id).await {
        warn!(user_id = %user_id, error = %e, "Failed to invalidate quota cache");
    }
    drop(guard);
    release_fill_lock(&locks, &user_id);
}

/// Forget a fill lock nobody else holds
fn release_fill_lock(locks: &FillLocks, user_id: &str) {
    locks.remove_if(user_id, |_, lock| Arc::strong_count(lock) == 1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::cache::LocalCache;
    use crate::quota::error::{CacheError, StoreError};
    use crate::quota::store::MemoryStore;
    use crate::quota::types::{HealthStatus, UserQuota};
    use async_trait::async_trait;

    fn ledger() -> (Arc<MemoryStore>, Arc<LocalCache>, QuotaLedger) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(LocalCache::default());
        let ledger = QuotaLedger::new(store.clone(), cache.clone());
        (store, cache, ledger)
    }

    struct BrokenCache;

    #[async_trait]
    impl QuotaCache for BrokenCache {
        async fn get(&self, _: &str) -> Result<Option<QuotaSnapshot>, CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }
        async fn set(&self, _: &str, _: QuotaSnapshot, _: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }
        async fn invalidate(&self, _: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }
        async fn ping(&self) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("down".to_string()))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl QuotaStore for BrokenStore {
        async fn get_user(&self, _: &str) -> Result<Option<UserQuota>, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn create_user(&self, _: &str, _: u64) -> Result<UserQuota, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn charge(&self, _: &str, _: u64) -> Result<UserQuota, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn insert_request(&self, _: &RequestRecord) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn requests_for(&self, _: &str) -> Result<Vec<RequestRecord>, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn delete_user(&self, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("down".to_string()))
        }
    }

    /// Memory store whose reads take `delay`
    struct SlowReadStore {
        inner: MemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl QuotaStore for SlowReadStore {
        async fn get_user(&self, user_id: &str) -> Result<Option<UserQuota>, StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.get_user(user_id).await
        }
        async fn create_user(&self, user_id: &str, words_total: u64) -> Result<UserQuota, StoreError> {
            self.inner.create_user(user_id, words_total).await
        }
        async fn charge(&self, user_id: &str, amount: u64) -> Result<UserQuota, StoreError> {
            self.inner.charge(user_id, amount).await
        }
        async fn insert_request(&self, record: &RequestRecord) -> Result<(), StoreError> {
            self.inner.insert_request(record).await
        }
        async fn requests_for(&self, user_id: &str) -> Result<Vec<RequestRecord>, StoreError> {
            self.inner.requests_for(user_id).await
        }
        async fn delete_user(&self, user_id: &str) -> Result<bool, StoreError> {
            self.inner.delete_user(user_id).await
        }
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
    }

    /// Local cache whose invalidations take `delay`
    struct SlowInvalidateCache {
        inner: LocalCache,
        delay: Duration,
    }

    #[async_trait]
    impl QuotaCache for SlowInvalidateCache {
        async fn get(&self, user_id: &str) -> Result<Option<QuotaSnapshot>, CacheError> {
            self.inner.get(user_id).await
        }
        async fn set(&self, user_id: &str, snapshot: QuotaSnapshot, ttl: Duration) -> Result<(), CacheError> {
            self.inner.set(user_id, snapshot, ttl).await
        }
        async fn invalidate(&self, user_id: &str) -> Result<(), CacheError> {
            tokio::time::sleep(self.delay).await;
            self.inner.invalidate(user_id).await
        }
        async fn ping(&self) -> Result<(), CacheError> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_available_creates_user_with_default_quota() {
        let (store, cache, ledger) = ledger();

        assert_eq!(ledger.available("alice").await.unwrap(), DEFAULT_WORD_QUOTA);
        assert!(store.get_user("alice").await.unwrap().is_some());
        assert!(cache.get("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cache_hit_skips_store() {
        let (store, cache, ledger) = ledger();
        ledger.available("alice").await.unwrap();

        // Drop the durable row; a hit must not notice
        store.delete_user("alice").await.unwrap();
        assert_eq!(ledger.available("alice").await.unwrap(), DEFAULT_WORD_QUOTA);

        cache.invalidate("alice").await.unwrap();
        // Miss recreates the row
        assert_eq!(ledger.available("alice").await.unwrap(), DEFAULT_WORD_QUOTA);
    }

    #[tokio::test]
    async fn test_charge_invalidates_cache() {
        let (_store, cache, ledger) = ledger();
        ledger.available("alice").await.unwrap();

        let left = ledger.charge("alice", 3).await.unwrap();
        assert_eq!(left, DEFAULT_WORD_QUOTA - 3);
        assert!(cache.get("alice").await.unwrap().is_none());

        assert_eq!(ledger.available("alice").await.unwrap(), DEFAULT_WORD_QUOTA - 3);
    }

    #[tokio::test]
    async fn test_charge_clamps_at_zero() {
        let (store, _cache, ledger) = ledger();
        store.insert_user(UserQuota::new("bob", 2));

        assert_eq!(ledger.charge("bob", 10).await.unwrap(), 0);
        assert_eq!(ledger.available("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_charge_keeps_cache() {
        let (_store, cache, ledger) = ledger();
        cache
            .set(
                "ghost",
                QuotaSnapshot {
                    words_left: 5,
                    words_total: 5,
                },
                DEFAULT_CACHE_TTL,
            )
            .await
            .unwrap();

        assert!(ledger.charge("ghost", 1).await.is_err());
        assert!(cache.get("ghost").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stats_reports_usage() {
        let (_store, _cache, ledger) = ledger();
        ledger.available("carol").await.unwrap();
        ledger.charge("carol", 42).await.unwrap();

        let stats = ledger.stats("carol").await.unwrap();
        assert_eq!(stats.words_used, 42);
        assert_eq!(stats.words_total, DEFAULT_WORD_QUOTA);
    }

    #[tokio::test]
    async fn test_cache_failure_falls_back_to_store() {
        let store = Arc::new(MemoryStore::new());
        let ledger = QuotaLedger::new(store.clone(), Arc::new(BrokenCache));

        assert_eq!(ledger.available("dave").await.unwrap(), DEFAULT_WORD_QUOTA);
        assert_eq!(ledger.charge("dave", 7).await.unwrap(), DEFAULT_WORD_QUOTA - 7);
        assert_eq!(ledger.available("dave").await.unwrap(), DEFAULT_WORD_QUOTA - 7);

        assert_eq!(ledger.health().await.status, HealthStatus::Degraded);
    }

    #[tokio::test]
    async fn test_store_failure_is_returned() {
        let ledger = QuotaLedger::new(Arc::new(BrokenStore), Arc::new(LocalCache::default()));
        let result = ledger.available("erin").await;
        assert!(matches!(
            result,
            Err(LedgerError::Store(StoreError::Unavailable(_)))
        ));
    }

    #[tokio::test]
    async fn test_health_unhealthy_when_both_down() {
        let ledger = QuotaLedger::new(Arc::new(BrokenStore), Arc::new(BrokenCache));
        assert_eq!(ledger.health().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_available_never_exceeds_durable_under_concurrency() {
        let (store, _cache, ledger) = ledger();
        let ledger = Arc::new(ledger);
        ledger.available("frank").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..40 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    ledger.charge("frank", 1).await.unwrap();
                } else {
                    ledger.available("frank").await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let durable = store.get_user("frank").await.unwrap().unwrap().words_left;
        assert_eq!(durable, DEFAULT_WORD_QUOTA - 20);
        assert_eq!(ledger.available("frank").await.unwrap(), durable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_charge_waits_for_inflight_fill() {
        let store = Arc::new(SlowReadStore {
            inner: MemoryStore::new(),
            delay: Duration::from_secs(40),
        });
        store.inner.insert_user(UserQuota::new("alice", 100));
        let ledger = Arc::new(QuotaLedger::new(store.clone(), Arc::new(LocalCache::default())));

        let reader = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move { ledger.available("alice").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The fill holds the lock, so the charge is abandoned before it commits
        let timed_out = tokio::time::timeout(Duration::from_secs(30), ledger.charge("alice", 10)).await;
        assert!(timed_out.is_err());
        assert_eq!(store.inner.get_user("alice").await.unwrap().unwrap().words_left, 100);
        assert_eq!(reader.await.unwrap().unwrap(), 100);

        assert_eq!(ledger.charge("alice", 10).await.unwrap(), 90);
        assert_eq!(ledger.available("alice").await.unwrap(), 90);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_charge_still_invalidates() {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(UserQuota::new("bob", 100));
        let cache = Arc::new(SlowInvalidateCache {
            inner: LocalCache::default(),
            delay: Duration::from_secs(10),
        });
        let ledger = QuotaLedger::new(store.clone(), cache.clone());
        assert_eq!(ledger.available("bob").await.unwrap(), 100);

        // Commit lands, then the caller gives up during invalidation
        let timed_out = tokio::time::timeout(Duration::from_secs(1), ledger.charge("bob", 10)).await;
        assert!(timed_out.is_err());
        assert_eq!(store.get_user("bob").await.unwrap().unwrap().words_left, 90);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(cache.get("bob").await.unwrap().is_none());
        assert_eq!(ledger.available("bob").await.unwrap(), 90);
        assert!(ledger.fill_locks.is_empty());
    }

    #[tokio::test]
    async fn test_fill_locks_are_released() {
        let (_store, _cache, ledger) = ledger();
        ledger.available("gina").await.unwrap();
        ledger.charge("gina", 1).await.unwrap();
        assert!(ledger.fill_locks.is_empty());
    }
}
