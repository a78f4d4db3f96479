//! Durable FIFO of admitted submissions with at-least-once delivery,
//! per-message receipts, poison-pill quarantine, and atomic
//! negative-acknowledge.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use warden_model::SandboxRequest;

use crate::error::Result;

mod memory;
mod redis;

pub use self::memory::InMemoryWorkQueue;
pub use self::redis::RedisWorkQueue;

/// Field carrying the serialized request inside a stream entry. Entries
/// without it are poison.
pub(crate) const DATA_FIELD: &str = "data";

/// Metric names emitted through the [`MetricsSink`](crate::metrics::MetricsSink) seam.
pub mod metric {
    pub const ENQUEUED: &str = "queue.enqueued";
    pub const DEQUEUED: &str = "queue.dequeued";
    pub const NACKED: &str = "queue.nacked";
    pub const NACK_ERRORS: &str = "queue.nack_errors";
    pub const POISONED_PREFIX: &str = "queue.poisoned.";
    pub const DEPTH: &str = "queue.depth";
    pub const DLQ_DEPTH: &str = "queue.dlq_depth";
}

/// Opaque token identifying one in-flight delivery. Every delivery holds
/// exactly one receipt; every receipt resolves via ack or nack.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(pub(crate) String);

impl Receipt {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue configuration. A producer with `node_routing_enabled` appends to
/// `<stream_key>:<node_id>` for requests carrying an assigned node and to
/// `stream_key` otherwise; a per-node consumer is simply constructed with
/// its own routed key as `stream_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkQueueConfig {
    pub stream_key: String,
    pub consumer_group: String,
    pub consumer_name: String,
    #[serde(default)]
    pub node_routing_enabled: bool,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            stream_key: "warden:submissions".to_string(),
            consumer_group: "warden-workers".to_string(),
            consumer_name: "worker-0".to_string(),
            node_routing_enabled: false,
        }
    }
}

impl WorkQueueConfig {
    pub fn dlq_key(&self) -> String {
        format!("{}:dlq", self.stream_key)
    }

    /// Destination key for one request under the routing rules.
    pub fn routed_key(&self, request: &SandboxRequest) -> String {
        match (&request.node_id, self.node_routing_enabled) {
            (Some(node), true) => format!("{}:{}", self.stream_key, node),
            _ => self.stream_key.clone(),
        }
    }
}

/// Entry written to the dead-letter stream when a delivered payload fails
/// to decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub error_reason: String,
    pub original_id: String,
    pub dlq_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Optional side-channel notified on every dead-letter move. Failures
/// here are logged and must never prevent the atomic DLQ move itself.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, entry: &DeadLetterEntry) -> anyhow::Result<()>;
}

/// Durable work queue contract. Ordering is FIFO per producer;
/// cross-producer ordering is undefined. `dequeue` never returns poison.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, request: &SandboxRequest) -> Result<()>;

    /// Blocks until a decodable message is available or `cancel` fires.
    async fn dequeue(&self, cancel: &CancellationToken) -> Result<(SandboxRequest, Receipt)>;

    /// O(1) regardless of pending-list size; unknown receipts are a no-op.
    async fn ack(&self, receipt: &Receipt) -> Result<()>;

    /// Atomically re-publishes the payload at the tail and retires the old
    /// receipt; all-or-nothing.
    async fn nack(&self, receipt: &Receipt, reason: &str) -> Result<()>;

    async fn depth(&self) -> Result<u64>;

    async fn pending_count(&self) -> Result<u64>;

    async fn dlq_depth(&self) -> Result<u64>;
}

/// Shared handle alias used by the manager wiring.
pub type SharedQueue = Arc<dyn WorkQueue>;

/// Why a delivered payload was judged poison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PoisonReason {
    MissingDataField,
    JsonUnmarshal,
}

impl PoisonReason {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::MissingDataField => "missing_data_field",
            Self::JsonUnmarshal => "json_unmarshal_error",
        }
    }
}

/// Decode the `data` field of a delivered entry into a request.
pub(crate) fn decode_fields(
    fields: &HashMap<String, String>,
) -> std::result::Result<SandboxRequest, PoisonReason> {
    let raw = fields
        .get(DATA_FIELD)
        .ok_or(PoisonReason::MissingDataField)?;
    serde_json::from_str(raw).map_err(|_| PoisonReason::JsonUnmarshal)
}

pub(crate) fn encode_request(request: &SandboxRequest) -> Result<String> {
    Ok(serde_json::to_string(request)?)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use warden_model::{ResourceSpec, TemplateId};

    use super::*;

    fn request() -> SandboxRequest {
        SandboxRequest::new(
            TemplateId::from("hello-world"),
            ResourceSpec::new(500, 64, Duration::from_secs(30)),
        )
    }

    #[test]
    fn decode_round_trips() {
        let request = request();
        let mut fields = HashMap::new();
        fields.insert(DATA_FIELD.to_string(), encode_request(&request).unwrap());
        let decoded = decode_fields(&fields).unwrap();
        assert_eq!(decoded.id, request.id);
    }

    #[test]
    fn missing_data_field_is_poison() {
        let fields = HashMap::from([("other".to_string(), "x".to_string())]);
        assert_eq!(
            decode_fields(&fields).unwrap_err(),
            PoisonReason::MissingDataField
        );
    }

    #[test]
    fn malformed_json_is_poison() {
        let fields = HashMap::from([(DATA_FIELD.to_string(), "{invalid".to_string())]);
        assert_eq!(
            decode_fields(&fields).unwrap_err(),
            PoisonReason::JsonUnmarshal
        );
    }

    #[test]
    fn routing_targets_the_node_key() {
        let config = WorkQueueConfig {
            node_routing_enabled: true,
            ..WorkQueueConfig::default()
        };
        let mut req = request();
        assert_eq!(config.routed_key(&req), "warden:submissions");
        req.node_id = Some("node-a".into());
        assert_eq!(config.routed_key(&req), "warden:submissions:node-a");
    }
}
