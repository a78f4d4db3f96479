use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::ids::{NodeId, RunId, TemplateId};

/// Lifecycle state of a sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Scheduled,
    Running,
    Hibernated,
    Failed,
    Terminated,
    Succeeded,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Terminated | Self::Succeeded)
    }

    /// Legal lifecycle edges. Pending is the unique initial state; the
    /// terminal states admit nothing.
    pub fn can_transition(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, to),
            (Pending, Scheduled)
                | (Pending, Failed)
                | (Pending, Terminated)
                | (Scheduled, Running)
                | (Scheduled, Failed)
                | (Scheduled, Terminated)
                | (Running, Hibernated)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Terminated)
                | (Hibernated, Running)
                | (Hibernated, Failed)
                | (Hibernated, Terminated)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Hibernated => "hibernated",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::Succeeded => "succeeded",
        };
        write!(f, "{name}")
    }
}

/// Persisted record of a sandbox run. The run ID equals the request ID;
/// run ID and template ID are immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRun {
    pub id: RunId,
    pub template_id: TemplateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SandboxRun {
    pub fn pending(id: RunId, template_id: TemplateId) -> Self {
        let now = Utc::now();
        Self {
            id,
            template_id,
            node_id: None,
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            error: None,
            metadata: HashMap::new(),
        }
    }

    /// Move the run to `status`, refusing edges the lifecycle graph does
    /// not contain. The registry itself stores last-writer-wins; owners
    /// call this before persisting.
    pub fn transition(&mut self, status: RunStatus) -> Result<()> {
        if !self.status.can_transition(status) {
            return Err(ModelError::InvalidTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(RunStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }
}
