//! Rolling node-hour spend, the input to budget enforcement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;

#[async_trait]
pub trait SpendLog: Send + Sync {
    async fn record_spend(&self, at: DateTime<Utc>, amount: f64) -> Result<()>;

    /// Total spend at or after `from`.
    async fn spend_since(&self, from: DateTime<Utc>) -> Result<f64>;
}

#[derive(Debug, Default)]
pub struct InMemorySpendLog {
    entries: RwLock<Vec<(DateTime<Utc>, f64)>>,
}

#[async_trait]
impl SpendLog for InMemorySpendLog {
    async fn record_spend(&self, at: DateTime<Utc>, amount: f64) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.push((at, amount));
        Ok(())
    }

    async fn spend_since(&self, from: DateTime<Utc>) -> Result<f64> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|(at, _)| *at >= from)
            .map(|(_, amount)| amount)
            .sum())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SpendEntry {
    id: Uuid,
    at: DateTime<Utc>,
    amount: f64,
}

/// Spend entries on a Redis sorted set scored by unix second. Members
/// carry a UUID so identical amounts in the same second stay distinct.
pub struct RedisSpendLog {
    conn: ConnectionManager,
    key: String,
}

impl std::fmt::Debug for RedisSpendLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSpendLog")
            .field("key", &self.key)
            .finish()
    }
}

impl RedisSpendLog {
    pub async fn new(redis_url: &str, key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn, key))
    }

    pub fn with_connection(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
        }
    }
}

#[async_trait]
impl SpendLog for RedisSpendLog {
    async fn record_spend(&self, at: DateTime<Utc>, amount: f64) -> Result<()> {
        let entry = SpendEntry {
            id: Uuid::now_v7(),
            at,
            amount,
        };
        let member = serde_json::to_string(&entry)?;
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(&self.key, member, at.timestamp()).await?;
        Ok(())
    }

    async fn spend_since(&self, from: DateTime<Utc>) -> Result<f64> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrangebyscore(&self.key, from.timestamp(), "+inf")
            .await?;
        let mut total = 0.0;
        for member in members {
            let entry: SpendEntry = serde_json::from_str(&member)?;
            total += entry.amount;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spend_since_is_a_rolling_window() {
        let log = InMemorySpendLog::default();
        let now = Utc::now();
        log.record_spend(now - chrono::Duration::hours(30), 7.0)
            .await
            .unwrap();
        log.record_spend(now - chrono::Duration::hours(2), 3.0)
            .await
            .unwrap();
        log.record_spend(now, 1.5).await.unwrap();

        let day = log
            .spend_since(now - chrono::Duration::hours(24))
            .await
            .unwrap();
        assert!((day - 4.5).abs() < 1e-9);

        let all = log
            .spend_since(now - chrono::Duration::days(31))
            .await
            .unwrap();
        assert!((all - 11.5).abs() < 1e-9);
    }
}
