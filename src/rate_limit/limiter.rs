//! Rate Limiter
//!
//! Per-user fixed-window admission control. Counters live in a sharded
//! concurrent map: `admit` updates a user's counter while holding that entry's
//! shard lock, so one user's admissions are linearizable and users on other
//! shards never wait on each other.
//!
//! Counters expire lazily on the next `admit` and are also removed by a
//! background sweep owned by the limiter. The sweep only removes a counter
//! under the same shard lock after re-checking expiry, and an `admit` that
//! finds no entry simply creates one, so a sweep racing an admission never
//! loses an increment.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::config::RateLimitConfig;
use super::counter::RateCounter;
use crate::metrics;

type CounterMap = DashMap<String, RateCounter>;

/// Fixed-window per-user rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    counters: Arc<CounterMap>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a limiter and start its sweep task
    ///
    /// Must be called inside a tokio runtime when the limiter is enabled.
    pub fn new(config: RateLimitConfig) -> Self {
        let mut limiter = Self::without_sweep(config);
        if limiter.config.enabled {
            let handle = spawn_sweeper(
                Arc::clone(&limiter.counters),
                limiter.config.window(),
                limiter.config.sweep_interval(),
                limiter.cancel.clone(),
            );
            limiter.sweeper = Mutex::new(Some(handle));
        }
        limiter
    }

    /// Create a limiter whose counters are only expired lazily or by [`sweep`](Self::sweep)
    pub fn without_sweep(config: RateLimitConfig) -> Self {
        Self {
            config,
            counters: Arc::new(DashMap::new()),
            cancel: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Create a disabled rate limiter (for testing)
    pub fn disabled() -> Self {
        Self::without_sweep(RateLimitConfig::disabled())
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count a request for `user_id`, returning whether it is admitted
    pub fn admit(&self, user_id: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        let now = Instant::now();
        let limit = self.config.requests_per_window;
        let window = self.config.window();

        if let Some(mut counter) = self.counters.get_mut(user_id) {
            return counter.try_admit(now, limit, window);
        }

        match self.counters.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => entry.get_mut().try_admit(now, limit, window),
            Entry::Vacant(entry) => {
                entry.insert(RateCounter::new(now));
                limit > 0
            }
        }
    }

    /// Remove every counter whose window has fully elapsed
    pub fn sweep(&self) -> usize {
        sweep_expired(&self.counters, self.config.window())
    }

    /// Number of live counters
    pub fn tracked_users(&self) -> usize {
        self.counters.len()
    }

    /// Current count for a user, if a counter exists
    pub fn count_for(&self, user_id: &str) -> Option<u32> {
        self.counters.get(user_id).map(|c| c.count)
    }

    pub fn is_sweeping(&self) -> bool {
        !self.cancel.is_cancelled()
            && self
                .sweeper
                .try_lock()
                .map(|slot| slot.is_some())
                .unwrap_or(true)
    }

    /// Stop the sweep task and wait for it to exit
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.sweeper.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
            info!("Rate limiter sweep stopped");
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn sweep_expired(counters: &CounterMap, window: Duration) -> usize {
    let now = Instant::now();
    let mut removed = 0;
    counters.retain(|_, counter| {
        let keep = !counter.is_expired(now, window);
        if !keep {
            removed += 1;
        }
        keep
    });
    metrics::RATE_LIMIT_TRACKED_USERS.set(counters.len() as i64);
    removed
}

fn spawn_sweeper(
    counters: Arc<CounterMap>,
    window: Duration,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = sweep_expired(&counters, window);
                    if removed > 0 {
                        debug!(removed = removed, remaining = counters.len(), "Swept expired rate counters");
                    }
                }
            }
        }
    })
}
