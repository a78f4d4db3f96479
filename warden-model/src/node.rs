use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, RunId};
use crate::request::ResourceSpec;

/// Label a node must carry to be eligible for quarantined workloads.
pub const QUARANTINE_LABEL: &str = "quarantine";

/// Capacity totals tracked per node. TTL does not apply to node capacity,
/// so this is a reduced view of [`ResourceSpec`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    #[serde(default)]
    pub gpu: u64,
}

impl Capacity {
    pub fn new(cpu_millis: u64, memory_mb: u64) -> Self {
        Self {
            cpu_millis,
            memory_mb,
            gpu: 0,
        }
    }

    /// Component-wise saturating difference.
    pub fn minus(&self, other: &Capacity) -> Capacity {
        Capacity {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            gpu: self.gpu.saturating_sub(other.gpu),
        }
    }

    pub fn holds(&self, request: &ResourceSpec) -> bool {
        self.cpu_millis >= request.cpu_millis
            && self.memory_mb >= request.memory_mb
            && self.gpu >= request.gpu
    }
}

/// Live view of a worker node as assembled from its heartbeats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub address: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub capacity: Capacity,
    pub allocated: Capacity,
    pub active_sandboxes: Vec<RunId>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub draining: bool,
}

impl NodeStatus {
    /// A node is live iff its heartbeat is within the TTL. Every consumer
    /// of the node set must filter on this.
    pub fn is_live(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        age <= chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    /// Unallocated headroom.
    pub fn free(&self) -> Capacity {
        self.capacity.minus(&self.allocated)
    }

    pub fn sandbox_count(&self) -> usize {
        self.active_sandboxes.len()
    }

    pub fn is_quarantine_node(&self) -> bool {
        self.labels.get(QUARANTINE_LABEL).is_some_and(|v| v == "true")
    }
}

/// Payload a worker sends on its heartbeat interval. Upserted verbatim
/// into the registry; a heartbeat never un-expires a node implicitly, it
/// overwrites the timestamp with `sent_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub node_id: NodeId,
    pub address: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub capacity: Capacity,
    pub allocated: Capacity,
    pub active_sandboxes: Vec<RunId>,
    pub sent_at: DateTime<Utc>,
}

impl HeartbeatPayload {
    pub fn into_status(self, draining: bool) -> NodeStatus {
        NodeStatus {
            id: self.node_id,
            address: self.address,
            labels: self.labels,
            capacity: self.capacity,
            allocated: self.allocated,
            active_sandboxes: self.active_sandboxes,
            last_heartbeat: self.sent_at,
            draining,
        }
    }
}
