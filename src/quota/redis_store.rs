//! Redis-backed quota store
//!
//! Users live in hashes under `user:{id}`; request records are JSON strings
//! appended to `requests:{id}`. Every read-modify-write runs as a Lua script
//! so Redis executes it atomically, which gives the same per-user
//! serialization the in-memory row locks provide.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use tracing::info;

use super::error::StoreError;
use super::store::QuotaStore;
use super::types::{RequestRecord, UserQuota};

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    redis.call('HSET', KEYS[1],
        'words_left', ARGV[1],
        'words_total', ARGV[1],
        'created_at', ARGV[2],
        'updated_at', ARGV[2])
end
return redis.call('HGETALL', KEYS[1])
"#;

const CHARGE_SCRIPT: &str = r#"
local left = redis.call('HGET', KEYS[1], 'words_left')
if not left then
    return {}
end
local remaining = tonumber(left) - tonumber(ARGV[1])
if remaining < 0 then
    remaining = 0
end
redis.call('HSET', KEYS[1], 'words_left', remaining, 'updated_at', ARGV[2])
return redis.call('HGETALL', KEYS[1])
"#;

const INSERT_REQUEST_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
redis.call('RPUSH', KEYS[2], ARGV[1])
return 1
"#;

const DELETE_USER_SCRIPT: &str = r#"
local removed = redis.call('DEL', KEYS[1])
redis.call('DEL', KEYS[2])
return removed
"#;

fn user_key(user_id: &str) -> String {
    format!("user:{}", user_id)
}

fn requests_key(user_id: &str) -> String {
    format!("requests:{}", user_id)
}

/// Quota store on a shared multiplexed Redis connection
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    create_script: Script,
    charge_script: Script,
    insert_request_script: Script,
    delete_user_script: Script,
}

impl RedisStore {
    /// Connect to Redis at `url`
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = %url, "Connected quota store to Redis");
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            create_script: Script::new(CREATE_SCRIPT),
            charge_script: Script::new(CHARGE_SCRIPT),
            insert_request_script: Script::new(INSERT_REQUEST_SCRIPT),
            delete_user_script: Script::new(DELETE_USER_SCRIPT),
        }
    }
}

/// Decode an `HGETALL` reply into a row
fn parse_user(user_id: &str, fields: HashMap<String, String>) -> Result<UserQuota, StoreError> {
    let key = user_key(user_id);
    let field = |name: &str| {
        fields.get(name).ok_or_else(|| StoreError::CorruptRecord {
            key: key.clone(),
            reason: format!("missing field {}", name),
        })
    };
    let number = |name: &str| -> Result<u64, StoreError> {
        field(name)?.parse::<u64>().map_err(|e| StoreError::CorruptRecord {
            key: key.clone(),
            reason: format!("{}: {}", name, e),
        })
    };
    let timestamp = |name: &str| -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(field(name)?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StoreError::CorruptRecord {
                key: key.clone(),
                reason: format!("{}: {}", name, e),
            })
    };

    Ok(UserQuota {
        user_id: user_id.to_string(),
        words_left: number("words_left")?,
        words_total: number("words_total")?,
        created_at: timestamp("created_at")?,
        updated_at: timestamp("updated_at")?,
    })
}

fn pairs_to_map(flat: Vec<String>) -> HashMap<String, String> {
    let mut map = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        map.insert(k, v);
    }
    map
}

#[async_trait]
impl QuotaStore for RedisStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserQuota>, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(user_key(user_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_user(user_id, fields).map(Some)
    }

    async fn create_user(&self, user_id: &str, words_total: u64) -> Result<UserQuota, StoreError> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .create_script
            .key(user_key(user_id))
            .arg(words_total)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        parse_user(user_id, pairs_to_map(flat))
    }

    async fn charge(&self, user_id: &str, amount: u64) -> Result<UserQuota, StoreError> {
        let mut conn = self.conn.clone();
        let flat: Vec<String> = self
            .charge_script
            .key(user_key(user_id))
            .arg(amount)
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        if flat.is_empty() {
            return Err(StoreError::UserNotFound(user_id.to_string()));
        }
        parse_user(user_id, pairs_to_map(flat))
    }

    async fn insert_request(&self, record: &RequestRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(record)?;
        let mut conn = self.conn.clone();
        let inserted: i64 = self
            .insert_request_script
            .key(user_key(&record.user_id))
            .key(requests_key(&record.user_id))
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;
        if inserted == 0 {
            return Err(StoreError::UserNotFound(record.user_id.clone()));
        }
        Ok(())
    }

    async fn requests_for(&self, user_id: &str) -> Result<Vec<RequestRecord>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn.lrange(requests_key(user_id), 0, -1).await?;
        raw.iter()
            .map(|entry| serde_json::from_str(entry).map_err(StoreError::from))
            .collect()
    }

    async fn delete_user(&self, user_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .delete_user_script
            .key(user_key(user_id))
            .key(requests_key(user_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
