//! Per-user word quotas
//!
//! - [`QuotaStore`]: durable, transactional record store (memory or Redis)
//! - [`QuotaCache`]: best-effort TTL mirror (moka or Redis)
//! - [`QuotaLedger`]: read-through composition and sole writer of `words_left`

pub mod cache;
pub mod error;
pub mod ledger;
pub mod redis_store;
pub mod store;
pub mod types;

pub use cache::{LocalCache, QuotaCache, RedisCache};
pub use error::{CacheError, LedgerError, StoreError};
pub use ledger::{LedgerSettings, QuotaLedger};
pub use redis_store::RedisStore;
pub use store::{MemoryStore, QuotaStore};
pub use types::{
    DependencyStatus, HealthReport, HealthStatus, QuotaSnapshot, QuotaStats, RequestRecord,
    UserQuota, DEFAULT_WORD_QUOTA,
};
