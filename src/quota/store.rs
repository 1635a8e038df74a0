//! Durable Quota Store
//!
//! The store is the authoritative home of every user's word quota and of the
//! request records written after each stream. `charge` is the only operation
//! that mutates a quota row and must run as one read-modify-write transaction
//! holding that user's row lock.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use super::error::StoreError;
use super::types::{RequestRecord, UserQuota};

/// Transactional key-value record store for quotas and request records
#[async_trait]
pub trait QuotaStore: Send + Sync + 'static {
    /// Read a user's row, `None` if the user has never been seen
    async fn get_user(&self, user_id: &str) -> Result<Option<UserQuota>, StoreError>;

    /// Insert a row with a full allowance unless one exists; returns the stored row
    async fn create_user(&self, user_id: &str, words_total: u64) -> Result<UserQuota, StoreError>;

    /// Atomically decrement `words_left` by `amount`, saturating at zero
    ///
    /// Concurrent charges for one user are serialized; the returned row is the
    /// committed state.
    async fn charge(&self, user_id: &str, amount: u64) -> Result<UserQuota, StoreError>;

    /// Persist an immutable request record; the owning user must exist
    async fn insert_request(&self, record: &RequestRecord) -> Result<(), StoreError>;

    /// Request records for a user in insertion order
    async fn requests_for(&self, user_id: &str) -> Result<Vec<RequestRecord>, StoreError>;

    /// Administrative removal of a user and, by cascade, their request records
    async fn delete_user(&self, user_id: &str) -> Result<bool, StoreError>;

    /// Trivial read used by the liveness probe
    async fn ping(&self) -> Result<(), StoreError>;
}

/// In-memory quota store
///
/// Each row sits behind its own async mutex, which plays the role of a
/// row-level lock: `charge` holds it for the whole read-modify-write, so
/// charges for one user serialize while other users proceed in parallel.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<String, Arc<Mutex<UserQuota>>>,
    requests: RwLock<Vec<RequestRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly (tests and fixtures)
    pub fn insert_user(&self, quota: UserQuota) {
        self.users
            .insert(quota.user_id.clone(), Arc::new(Mutex::new(quota)));
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    fn row(&self, user_id: &str) -> Option<Arc<Mutex<UserQuota>>> {
        // Clone the handle so the shard guard is released before awaiting the row lock
        self.users.get(user_id).map(|row| Arc::clone(row.value()))
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserQuota>, StoreError> {
        match self.row(user_id) {
            Some(row) => Ok(Some(row.lock().await.clone())),
            None => Ok(None),
        }
    }

    async fn create_user(&self, user_id: &str, words_total: u64) -> Result<UserQuota, StoreError> {
        let row = Arc::clone(
            self.users
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(UserQuota::new(user_id, words_total))))
                .value(),
        );
        let quota = row.lock().await.clone();
        Ok(quota)
    }

    async fn charge(&self, user_id: &str, amount: u64) -> Result<UserQuota, StoreError> {
        let row = self
            .row(user_id)
            .ok_or_else(|| StoreError::UserNotFound(user_id.to_string()))?;

        let mut locked = row.lock().await;
        let mut next = locked.clone();
        next.debit(amount);
        *locked = next.clone();

        Ok(next)
    }

    async fn insert_request(&self, record: &RequestRecord) -> Result<(), StoreError> {
        if !self.users.contains_key(&record.user_id) {
            return Err(StoreError::UserNotFound(record.user_id.clone()));
        }

        let mut requests = self.requests.write().await;
        requests.push(record.clone());
        Ok(())
    }

    async fn requests_for(&self, user_id: &str) -> Result<Vec<RequestRecord>, StoreError> {
        let requests = self.requests.read().await;
        Ok(requests
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn delete_user(&self, user_id: &str) -> Result<bool, StoreError> {
        let removed = self.users.remove(user_id).is_some();
        if removed {
            let mut requests = self.requests.write().await;
            requests.retain(|r| r.user_id != user_id);
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _ = self.requests.read().await.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_creation() {
        let store = MemoryStore::new();
        assert_eq!(store.user_count(), 0);
        assert!(store.get_user("user-123").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_user_is_idempotent() {
        let store = MemoryStore::new();

        let first = store.create_user("user-123", 1_000).await.unwrap();
        assert_eq!(first.words_left, 1_000);

        store.charge("user-123", 10).await.unwrap();

        // Second create must not reset the existing row
        let second = store.create_user("user-123", 1_000).await.unwrap();
        assert_eq!(second.words_left, 990);
        assert_eq!(store.user_count(), 1);
    }

    #[tokio::test]
    async fn test_charge_saturates_at_zero() {
        let store = MemoryStore::new();
        store.create_user("user-123", 5).await.unwrap();

        let row = store.charge("user-123", 3).await.unwrap();
        assert_eq!(row.words_left, 2);

        let row = store.charge("user-123", 10).await.unwrap();
        assert_eq!(row.words_left, 0);
        assert_eq!(row.words_total, 5);
    }

    #[tokio::test]
    async fn test_charge_unknown_user() {
        let store = MemoryStore::new();
        let result = store.charge("ghost", 1).await;
        assert!(matches!(result, Err(StoreError::UserNotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_charges_serialize() {
        let store = Arc::new(MemoryStore::new());
        store.create_user("user-123", 10_000).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..50u64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.charge("user-123", i % 7 + 1).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let total: u64 = (0..50u64).map(|i| i % 7 + 1).sum();
        let row = store.get_user("user-123").await.unwrap().unwrap();
        assert_eq!(row.words_left, 10_000 - total);
    }

    #[tokio::test]
    async fn test_insert_request_requires_user() {
        let store = MemoryStore::new();
        let record = RequestRecord::new("ghost", "the be to".to_string(), 3, 1.5);
        assert!(store.insert_request(&record).await.is_err());

        store.create_user("ghost", 100).await.unwrap();
        store.insert_request(&record).await.unwrap();

        let records = store.requests_for("ghost").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].token_count, 3);
    }

    #[tokio::test]
    async fn test_delete_user_cascades() {
        let store = MemoryStore::new();
        store.create_user("user-1", 100).await.unwrap();
        store.create_user("user-2", 100).await.unwrap();
        store
            .insert_request(&RequestRecord::new("user-1", "a".to_string(), 1, 0.5))
            .await
            .unwrap();
        store
            .insert_request(&RequestRecord::new("user-2", "b".to_string(), 1, 0.5))
            .await
            .unwrap();

        assert!(store.delete_user("user-1").await.unwrap());
        assert!(!store.delete_user("user-1").await.unwrap());

        assert!(store.requests_for("user-1").await.unwrap().is_empty());
        assert_eq!(store.requests_for("user-2").await.unwrap().len(), 1);
    }
}
