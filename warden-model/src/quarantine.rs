use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::ids::{QuarantineId, RequestId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineStatus {
    Active,
    Released,
}

/// Record of a request held under isolation overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub id: QuarantineId,
    pub request_id: RequestId,
    pub reason: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    pub status: QuarantineStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseApproval>,
}

impl QuarantineRecord {
    pub fn active(request_id: RequestId, reason: String, evidence: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: QuarantineId::new(),
            request_id,
            reason,
            evidence,
            status: QuarantineStatus::Active,
            created_at: now,
            updated_at: now,
            release: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    None,
    Monitored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeccompProfile {
    Strict,
    Default,
}

/// Isolation applied to quarantined sandboxes. The default is the
/// tightest configuration; release approvals may loosen individual
/// fields, each with a recorded justification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolationConfig {
    pub network: NetworkMode,
    pub seccomp: SeccompProfile,
    pub storage_dir: String,
    pub snapshot_prefix: String,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            network: NetworkMode::None,
            seccomp: SeccompProfile::Strict,
            storage_dir: "/var/lib/warden/quarantine".to_string(),
            snapshot_prefix: "quarantine/".to_string(),
        }
    }
}

/// A single loosening of the default isolation, with its justification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IsolationOverride {
    Network {
        mode: NetworkMode,
        justification: String,
    },
    Seccomp {
        profile: SeccompProfile,
        justification: String,
    },
}

impl IsolationOverride {
    pub fn justification(&self) -> &str {
        match self {
            Self::Network { justification, .. } | Self::Seccomp { justification, .. } => {
                justification
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.justification().trim().is_empty() {
            return Err(ModelError::InvalidField(
                "isolation override requires a justification".to_string(),
            ));
        }
        Ok(())
    }

    /// Mutates only the supplied config copy.
    pub fn apply(&self, config: &mut IsolationConfig) {
        match self {
            Self::Network { mode, .. } => config.network = *mode,
            Self::Seccomp { profile, .. } => config.seccomp = *profile,
        }
    }
}

/// Approval releasing a quarantined request, possibly carrying isolation
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseApproval {
    pub approver: String,
    pub justification: String,
    #[serde(default)]
    pub overrides: Vec<IsolationOverride>,
    pub approved_at: DateTime<Utc>,
}
