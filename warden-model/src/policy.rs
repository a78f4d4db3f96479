use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ids::{PolicyId, TemplateId};
use crate::request::ResourceSpec;

/// Network isolation class a policy can grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    None,
    Monitored,
    Restricted,
    Open,
}

impl std::fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Monitored => "monitored",
            Self::Restricted => "restricted",
            Self::Open => "open",
        };
        write!(f, "{name}")
    }
}

/// How long run artifacts outlive the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    Discard,
    Keep {
        #[serde(with = "crate::request::duration_secs")]
        for_duration: Duration,
    },
}

/// Per-template admission policy: the authority on what is admissible.
/// Versioned with optimistic concurrency; the store rejects upserts whose
/// version does not match the current one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub id: PolicyId,
    pub template_id: TemplateId,
    pub ceilings: ResourceSpec,
    pub network_class: NetworkClass,
    pub retention: RetentionPolicy,
    pub version: u64,
}

impl SandboxPolicy {
    pub fn new(template_id: TemplateId, ceilings: ResourceSpec) -> Self {
        Self {
            id: PolicyId::new(format!("policy-{template_id}")),
            template_id,
            ceilings,
            network_class: NetworkClass::None,
            retention: RetentionPolicy::Discard,
            version: 0,
        }
    }
}
