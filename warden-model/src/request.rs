use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::heat::HeatLevel;
use crate::ids::{NodeId, RequestId, TemplateId};

/// Well-known metadata keys recognised by the admission and placement
/// pipeline. Everything else in the metadata map is passed through opaque.
pub mod metadata_keys {
    /// Explicit heat hint; wins over the threshold table when parseable.
    pub const HEAT_HINT: &str = "heat_hint";
    /// Set to `"true"` when the request must be routed to quarantine nodes.
    pub const QUARANTINE: &str = "quarantine";
    /// Stamped by the audit judge.
    pub const AUDIT_ID: &str = "audit_id";
    /// Stamped by the audit judge.
    pub const COMPLIANCE_LEVEL: &str = "compliance_level";
    /// Prefix for hard label requirements: `scheduler.require.<k>=<v>`.
    pub const REQUIRE_PREFIX: &str = "scheduler.require.";
    /// Prefix for soft placement affinity: `scheduler.affinity.<k>=<v>`.
    pub const AFFINITY_PREFIX: &str = "scheduler.affinity.";
    /// Prefix for soft placement anti-affinity.
    pub const ANTI_AFFINITY_PREFIX: &str = "scheduler.antiaffinity.";
}

/// Resource demand of a sandbox on every dimension the placement engine
/// tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu_millis: u64,
    pub memory_mb: u64,
    #[serde(default)]
    pub gpu: u64,
    /// Requested sandbox lifetime.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl ResourceSpec {
    pub fn new(cpu_millis: u64, memory_mb: u64, ttl: Duration) -> Self {
        Self {
            cpu_millis,
            memory_mb,
            gpu: 0,
            ttl,
        }
    }

    /// True when `self` fits inside `ceiling` on every tracked dimension.
    pub fn fits_within(&self, ceiling: &ResourceSpec) -> bool {
        self.cpu_millis <= ceiling.cpu_millis
            && self.memory_mb <= ceiling.memory_mb
            && self.gpu <= ceiling.gpu
    }
}

/// A user submission for an isolated compute workload. The submission
/// manager owns this record while it is in flight; the scheduler fills
/// `node_id` and the heat classifier fills `heat_level`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRequest {
    pub id: RequestId,
    pub template_id: TemplateId,
    pub command: Vec<String>,
    pub resources: ResourceSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_policy: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heat_level: Option<HeatLevel>,
    pub created_at: DateTime<Utc>,
}

impl SandboxRequest {
    pub fn new(template_id: TemplateId, resources: ResourceSpec) -> Self {
        Self {
            id: RequestId::new(),
            template_id,
            command: Vec::new(),
            resources,
            network_policy: None,
            metadata: HashMap::new(),
            node_id: None,
            heat_level: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_quarantined(&self) -> bool {
        self.metadata
            .get(metadata_keys::QUARANTINE)
            .is_some_and(|v| v == "true")
    }

    pub fn mark_quarantined(&mut self) {
        self.metadata
            .insert(metadata_keys::QUARANTINE.to_string(), "true".to_string());
    }

    /// Hard label requirements; a node must carry every one of these.
    pub fn required_labels(&self) -> HashMap<&str, &str> {
        self.labels_with_prefix(metadata_keys::REQUIRE_PREFIX)
    }

    /// Soft affinity labels carried in the metadata map, with the prefix
    /// stripped.
    pub fn affinity_labels(&self) -> HashMap<&str, &str> {
        self.labels_with_prefix(metadata_keys::AFFINITY_PREFIX)
    }

    pub fn anti_affinity_labels(&self) -> HashMap<&str, &str> {
        self.labels_with_prefix(metadata_keys::ANTI_AFFINITY_PREFIX)
    }

    fn labels_with_prefix(&self, prefix: &str) -> HashMap<&str, &str> {
        self.metadata
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(prefix)
                    .map(|stripped| (stripped, v.as_str()))
            })
            .collect()
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(de)?;
        Ok(Duration::from_secs(secs))
    }
}
