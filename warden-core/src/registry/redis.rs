//! Registry on Redis hashes: one hash per record family, JSON values.
//! Expired nodes are evicted while listing, so readers always see the
//! live set.

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::debug;

use warden_model::{HeartbeatPayload, NodeId, NodeStatus, RunId, SandboxRun};

use crate::error::{Result, WardenError};

use super::{Registry, RegistryConfig};

const NODES_KEY: &str = "warden:registry:nodes";
const RUNS_KEY: &str = "warden:registry:runs";

pub struct RedisRegistry {
    conn: ConnectionManager,
    config: RegistryConfig,
}

impl std::fmt::Debug for RedisRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRegistry")
            .field("node_ttl", &self.config.node_ttl)
            .finish()
    }
}

impl RedisRegistry {
    pub async fn new(redis_url: &str, config: RegistryConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn, config))
    }

    pub fn with_connection(conn: ConnectionManager, config: RegistryConfig) -> Self {
        Self { conn, config }
    }

    async fn read_node(&self, id: &NodeId) -> Result<Option<NodeStatus>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(NODES_KEY, id.as_str()).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write_node(&self, node: &NodeStatus) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(node)?;
        let _: () = conn.hset(NODES_KEY, node.id.as_str(), json).await?;
        Ok(())
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    async fn list_nodes(&self) -> Result<Vec<NodeStatus>> {
        let mut conn = self.conn.clone();
        let all: Vec<(String, String)> = conn.hgetall(NODES_KEY).await?;

        let now = Utc::now();
        let mut live = Vec::new();
        let mut expired = Vec::new();
        for (field, json) in all {
            match serde_json::from_str::<NodeStatus>(&json) {
                Ok(node) if node.is_live(now, self.config.node_ttl) => live.push(node),
                Ok(node) => expired.push(node.id.to_string()),
                Err(error) => {
                    // Unparseable records are treated like expired ones.
                    debug!(%error, field, "evicting undecodable node record");
                    expired.push(field);
                }
            }
        }

        if !expired.is_empty() {
            let _: () = conn.hdel(NODES_KEY, &expired).await?;
        }

        live.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(live)
    }

    async fn get_node(&self, id: &NodeId) -> Result<NodeStatus> {
        self.read_node(id)
            .await?
            .filter(|node| node.is_live(Utc::now(), self.config.node_ttl))
            .ok_or_else(|| WardenError::NodeNotFound(id.clone()))
    }

    async fn heartbeat(&self, payload: HeartbeatPayload) -> Result<()> {
        let draining = self
            .read_node(&payload.node_id)
            .await?
            .map(|existing| existing.draining)
            .unwrap_or(false);
        self.write_node(&payload.into_status(draining)).await
    }

    async fn mark_draining(&self, id: &NodeId) -> Result<()> {
        let mut node = self
            .read_node(id)
            .await?
            .filter(|node| node.is_live(Utc::now(), self.config.node_ttl))
            .ok_or_else(|| WardenError::NodeNotFound(id.clone()))?;
        node.draining = true;
        self.write_node(&node).await
    }

    async fn update_run(&self, run: &SandboxRun) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(run)?;
        let _: () = conn.hset(RUNS_KEY, run.id.to_string(), json).await?;
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<SandboxRun> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(RUNS_KEY, id.to_string()).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(WardenError::RunNotFound(*id)),
        }
    }

    async fn list_runs(&self) -> Result<Vec<SandboxRun>> {
        let mut conn = self.conn.clone();
        let all: Vec<(String, String)> = conn.hgetall(RUNS_KEY).await?;
        let mut runs = Vec::with_capacity(all.len());
        for (_, json) in all {
            runs.push(serde_json::from_str(&json)?);
        }
        Ok(runs)
    }
}
