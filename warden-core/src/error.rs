use thiserror::Error;

use warden_model::{NodeId, RequestId, TemplateId};

#[derive(Error, Debug)]
pub enum WardenError {
    // Admission errors: surfaced to the submitter, no run is persisted.
    #[error("template not found: {0}")]
    TemplateNotFound(TemplateId),

    #[error("policy rejected submission: {reason}")]
    PolicyRejected { reason: String },

    // Placement errors: the run is persisted as Failed with the reason.
    #[error("insufficient capacity: {detail}")]
    NoCapacity { detail: String },

    // State errors: surfaced, caller may retry.
    #[error("sandbox not found: {0}")]
    SandboxNotFound(RequestId),

    #[error("run not found: {0}")]
    RunNotFound(RequestId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("quarantine record not found: {0}")]
    QuarantineNotFound(warden_model::QuarantineId),

    #[error("version conflict: expected {expected}, stored {actual}")]
    ConflictingVersion { expected: u64, actual: u64 },

    // Fatal at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("model error: {0}")]
    Model(#[from] warden_model::ModelError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Admission errors precede run persistence and are never retried by
    /// the core.
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Self::TemplateNotFound(_) | Self::PolicyRejected { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
