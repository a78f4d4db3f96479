//! Bounded storage for usage samples, time-ordered and keyed by unix
//! second.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;

use warden_model::UsageRecord;

use crate::error::Result;

/// Default history bound; older samples are trimmed on insert.
pub const DEFAULT_HISTORY_CAP: usize = 10_000;

#[async_trait]
pub trait UsageHistory: Send + Sync {
    async fn record(&self, record: UsageRecord) -> Result<()>;

    /// Samples in `[from, to)`, oldest first.
    async fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<UsageRecord>>;

    async fn all(&self) -> Result<Vec<UsageRecord>>;

    async fn len(&self) -> Result<usize>;
}

/// Ring-buffer history under a read-write lock.
#[derive(Debug)]
pub struct InMemoryUsageHistory {
    cap: usize,
    records: RwLock<VecDeque<UsageRecord>>,
}

impl Default for InMemoryUsageHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAP)
    }
}

impl InMemoryUsageHistory {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            records: RwLock::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl UsageHistory for InMemoryUsageHistory {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.push_back(record);
        while records.len() > self.cap {
            records.pop_front();
        }
        Ok(())
    }

    async fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter(|r| r.timestamp >= from && r.timestamp < to)
            .copied()
            .collect())
    }

    async fn all(&self) -> Result<Vec<UsageRecord>> {
        let records = self.records.read().await;
        Ok(records.iter().copied().collect())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.read().await.len())
    }
}

/// History on a Redis sorted set, scored by unix second.
pub struct RedisUsageHistory {
    conn: ConnectionManager,
    key: String,
    cap: usize,
}

impl std::fmt::Debug for RedisUsageHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisUsageHistory")
            .field("key", &self.key)
            .field("cap", &self.cap)
            .finish()
    }
}

impl RedisUsageHistory {
    pub async fn new(redis_url: &str, key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn, key))
    }

    pub fn with_connection(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
            cap: DEFAULT_HISTORY_CAP,
        }
    }

    pub fn with_capacity(mut self, cap: usize) -> Self {
        self.cap = cap.max(1);
        self
    }
}

#[async_trait]
impl UsageHistory for RedisUsageHistory {
    async fn record(&self, record: UsageRecord) -> Result<()> {
        let member = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(&self.key, member, record.unix_second())
            .await?;
        // Trim from the oldest end; the newest `cap` entries survive.
        let _: () = conn
            .zremrangebyrank(&self.key, 0, -(self.cap as isize) - 1)
            .await?;
        Ok(())
    }

    async fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore(&self.key, from.timestamp(), format!("({}", to.timestamp()))
            .await?;
        let mut records = Vec::with_capacity(members.len());
        for member in members {
            records.push(serde_json::from_str(&member)?);
        }
        Ok(records)
    }

    async fn all(&self) -> Result<Vec<UsageRecord>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrange(&self.key, 0, -1).await?;
        let mut records = Vec::with_capacity(members.len());
        for member in members {
            records.push(serde_json::from_str(&member)?);
        }
        Ok(records)
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let count: usize = conn.zcard(&self.key).await?;
        Ok(count)
    }
}
