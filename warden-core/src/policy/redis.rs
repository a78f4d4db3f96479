//! Policy store on a Redis hash. The version check and write run as one
//! server-side script so concurrent writers cannot interleave between
//! compare and set.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::Script;

use warden_model::{SandboxPolicy, TemplateId};

use crate::error::{Result, WardenError};

use super::PolicyStore;

const POLICIES_KEY: &str = "warden:policies";

fn upsert_script() -> Script {
    Script::new(
        r#"
        local raw = redis.call('HGET', KEYS[1], ARGV[1])
        local expected = tonumber(ARGV[2])
        if not raw then
            if expected ~= 0 then
                return {0, 0}
            end
            redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
            return {1, 1}
        end
        local stored = cjson.decode(raw)
        if tonumber(stored.version) ~= expected then
            return {0, tonumber(stored.version)}
        end
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
        return {1, expected + 1}
        "#,
    )
}

pub struct RedisPolicyStore {
    conn: ConnectionManager,
    upsert: Script,
}

impl std::fmt::Debug for RedisPolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPolicyStore").finish()
    }
}

impl RedisPolicyStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn))
    }

    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            upsert: upsert_script(),
        }
    }
}

#[async_trait]
impl PolicyStore for RedisPolicyStore {
    async fn get_policy(&self, template_id: &TemplateId) -> Result<SandboxPolicy> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(POLICIES_KEY, template_id.as_str()).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(WardenError::PolicyRejected {
                reason: format!("no policy registered for template {template_id}"),
            }),
        }
    }

    async fn upsert_policy(&self, mut policy: SandboxPolicy) -> Result<SandboxPolicy> {
        let expected = policy.version;
        policy.version += 1;
        let json = serde_json::to_string(&policy)?;

        let mut conn = self.conn.clone();
        let outcome: Vec<i64> = self
            .upsert
            .key(POLICIES_KEY)
            .arg(policy.template_id.as_str())
            .arg(expected)
            .arg(json)
            .invoke_async(&mut conn)
            .await?;

        match outcome.as_slice() {
            [1, _] => Ok(policy),
            [0, actual] => Err(WardenError::ConflictingVersion {
                expected,
                actual: *actual as u64,
            }),
            other => Err(WardenError::Internal(format!(
                "unexpected policy upsert reply: {other:?}"
            ))),
        }
    }
}
