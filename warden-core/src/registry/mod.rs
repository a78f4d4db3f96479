//! Membership of worker nodes (heartbeat-expiring) and the sandbox run
//! ledger. The registry owns run records; everything else reads them
//! through this interface.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use warden_model::{HeartbeatPayload, NodeId, NodeStatus, RunId, SandboxRun};

use crate::error::Result;

mod memory;
mod redis;

pub use self::memory::InMemoryRegistry;
pub use self::redis::RedisRegistry;

/// Default liveness window for worker nodes. Workers heartbeat on a
/// shorter interval (10 s by convention).
pub const DEFAULT_NODE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// A node is live iff now - last_heartbeat <= node_ttl.
    #[serde(with = "ttl_secs")]
    pub node_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            node_ttl: DEFAULT_NODE_TTL,
        }
    }
}

mod ttl_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(de)?))
    }
}

/// Node membership and run lifecycle storage.
///
/// Invariants: a node absent from `list_nodes` is never returned by
/// `get_node`; a heartbeat never un-expires a node implicitly, it
/// overwrites the record with the payload's timestamp. Run updates are
/// last-writer-wins; lifecycle enforcement happens at the owner.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Live nodes only; expired entries are evicted as a side effect.
    async fn list_nodes(&self) -> Result<Vec<NodeStatus>>;

    /// The node if live; expiration is indistinguishable from absence.
    async fn get_node(&self, id: &NodeId) -> Result<NodeStatus>;

    async fn heartbeat(&self, payload: HeartbeatPayload) -> Result<()>;

    /// Flags a node so the scheduler will not select it.
    async fn mark_draining(&self, id: &NodeId) -> Result<()>;

    async fn update_run(&self, run: &SandboxRun) -> Result<()>;

    async fn get_run(&self, id: &RunId) -> Result<SandboxRun>;

    async fn list_runs(&self) -> Result<Vec<SandboxRun>>;
}
