//! Quota Records
//!
//! Rows held by the durable store and the views built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default word allowance for a newly seen user
pub const DEFAULT_WORD_QUOTA: u64 = 1_000_000;

/// Durable per-user quota row
///
/// `words_left` never exceeds `words_total` and never drops below zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserQuota {
    pub user_id: String,
    pub words_left: u64,
    pub words_total: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserQuota {
    /// Fresh row with the full allowance
    pub fn new(user_id: &str, words_total: u64) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            words_left: words_total,
            words_total,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a decrement, saturating at zero
    pub fn debit(&mut self, amount: u64) {
        self.words_left = self.words_left.saturating_sub(amount);
        self.updated_at = Utc::now();
    }

    pub fn words_used(&self) -> u64 {
        self.words_total - self.words_left
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            words_left: self.words_left,
            words_total: self.words_total,
        }
    }
}

/// Cached mirror of a user's quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub words_left: u64,
    pub words_total: u64,
}

/// Quota inspection response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStats {
    pub user_id: String,
    pub words_left: u64,
    pub words_total: u64,
    pub words_used: u64,
}

impl QuotaStats {
    pub fn from_snapshot(user_id: &str, snapshot: QuotaSnapshot) -> Self {
        Self {
            user_id: user_id.to_string(),
            words_left: snapshot.words_left,
            words_total: snapshot.words_total,
            words_used: snapshot.words_total.saturating_sub(snapshot.words_left),
        }
    }
}

/// Immutable record of one finished generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: Uuid,
    pub user_id: String,
    /// Emitted tokens joined by single spaces
    pub data: String,
    pub token_count: u64,
    pub duration_seconds: f64,
    pub created_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn new(user_id: &str, data: String, token_count: u64, duration_seconds: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            data,
            token_count,
            duration_seconds,
            created_at: Utc::now(),
        }
    }
}

/// Health of a single dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyStatus {
    Healthy,
    Unhealthy,
}

impl DependencyStatus {
    pub fn from_ok(ok: bool) -> Self {
        if ok {
            Self::Healthy
        } else {
            Self::Unhealthy
        }
    }
}

/// Aggregate service health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Liveness probe report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    /// RFC 3339 timestamp of the probe
    pub timestamp: String,
    pub store: DependencyStatus,
    pub cache: DependencyStatus,
}

impl HealthReport {
    /// Build a report; one failing dependency degrades, two fail the probe
    pub fn from_checks(store_ok: bool, cache_ok: bool) -> Self {
        let status = match (store_ok, cache_ok) {
            (true, true) => HealthStatus::Healthy,
            (false, false) => HealthStatus::Unhealthy,
            _ => HealthStatus::Degraded,
        };

        Self {
            status,
            timestamp: Utc::now().to_rfc3339(),
            store: DependencyStatus::from_ok(store_ok),
            cache: DependencyStatus::from_ok(cache_ok),
        }
    }
}
