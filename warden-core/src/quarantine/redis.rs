//! Quarantine records on a Redis hash, JSON values keyed by record ID.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use warden_model::{QuarantineId, QuarantineRecord, QuarantineStatus};

use crate::error::{Result, WardenError};

use super::QuarantineStore;

const RECORDS_KEY: &str = "warden:quarantine";

pub struct RedisQuarantineStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisQuarantineStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQuarantineStore").finish()
    }
}

impl RedisQuarantineStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl QuarantineStore for RedisQuarantineStore {
    async fn insert(&self, record: QuarantineRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(&record)?;
        let _: () = conn.hset(RECORDS_KEY, record.id.to_string(), json).await?;
        Ok(())
    }

    async fn get(&self, id: &QuarantineId) -> Result<QuarantineRecord> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(RECORDS_KEY, id.to_string()).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(WardenError::QuarantineNotFound(*id)),
        }
    }

    async fn update(&self, record: &QuarantineRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.hexists(RECORDS_KEY, record.id.to_string()).await?;
        if !exists {
            return Err(WardenError::QuarantineNotFound(record.id));
        }
        let json = serde_json::to_string(record)?;
        let _: () = conn.hset(RECORDS_KEY, record.id.to_string(), json).await?;
        Ok(())
    }

    async fn list(&self, filter: Option<QuarantineStatus>) -> Result<Vec<QuarantineRecord>> {
        let mut conn = self.conn.clone();
        let all: Vec<(String, String)> = conn.hgetall(RECORDS_KEY).await?;
        let mut records = Vec::with_capacity(all.len());
        for (_, json) in all {
            let record: QuarantineRecord = serde_json::from_str(&json)?;
            if filter.is_none_or(|status| record.status == status) {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
