//! Quota Cache
//!
//! A best-effort TTL mirror of each user's quota. Entries are never
//! authoritative: the ledger only ever deletes them after a charge commits and
//! refills them from the durable store on the next miss.

use async_trait::async_trait;
use moka::future::Cache;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use super::error::CacheError;
use super::types::QuotaSnapshot;

/// Default lifetime of a cached quota entry
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

/// Cache key for a user's quota mirror
pub fn cache_key(user_id: &str) -> String {
    format!("user_words:{}", user_id)
}

/// TTL key-value cache in front of the durable store
#[async_trait]
pub trait QuotaCache: Send + Sync + 'static {
    async fn get(&self, user_id: &str) -> Result<Option<QuotaSnapshot>, CacheError>;

    async fn set(&self, user_id: &str, snapshot: QuotaSnapshot, ttl: Duration)
        -> Result<(), CacheError>;

    /// Delete the entry; deleting a missing entry is not an error
    async fn invalidate(&self, user_id: &str) -> Result<(), CacheError>;

    async fn ping(&self) -> Result<(), CacheError>;
}

#[derive(Debug, Clone, Copy)]
struct LocalEntry {
    snapshot: QuotaSnapshot,
    expires_at: Instant,
}

/// In-process cache backed by moka
///
/// moka enforces `max_ttl` as an upper bound; the per-entry deadline passed to
/// `set` is checked on read.
#[derive(Clone)]
pub struct LocalCache {
    inner: Cache<String, LocalEntry>,
}

impl LocalCache {
    pub fn new(capacity: u64, max_ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(max_ttl)
            .build();
        Self { inner }
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new(10_000, DEFAULT_CACHE_TTL)
    }
}

#[async_trait]
impl QuotaCache for LocalCache {
    async fn get(&self, user_id: &str) -> Result<Option<QuotaSnapshot>, CacheError> {
        let key = cache_key(user_id);
        match self.inner.get(&key).await {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.snapshot)),
            Some(_) => {
                self.inner.invalidate(&key).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        user_id: &str,
        snapshot: QuotaSnapshot,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let entry = LocalEntry {
            snapshot,
            expires_at: Instant::now() + ttl,
        };
        self.inner.insert(cache_key(user_id), entry).await;
        Ok(())
    }

    async fn invalidate(&self, user_id: &str) -> Result<(), CacheError> {
        self.inner.invalidate(&cache_key(user_id)).await;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Redis cache storing JSON snapshots under `user_words:{id}`
#[derive(Clone)]
pub struct RedisCache {
    conn: MultiplexedConnection,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = %url, "Connected quota cache to Redis");
        Ok(Self { conn })
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl QuotaCache for RedisCache {
    async fn get(&self, user_id: &str) -> Result<Option<QuotaSnapshot>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(cache_key(user_id)).await?;
        match raw {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| CacheError::InvalidEntry(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        user_id: &str,
        snapshot: QuotaSnapshot,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let json =
            serde_json::to_string(&snapshot).map_err(|e| CacheError::InvalidEntry(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(cache_key(user_id), json, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn invalidate(&self, user_id: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(cache_key(user_id)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
