//! Core data model definitions shared across Warden crates.
#![allow(missing_docs)]

pub mod error;
pub mod heat;
pub mod ids;
pub mod node;
pub mod policy;
pub mod quarantine;
pub mod request;
pub mod run;
pub mod season;
pub mod template;
pub mod usage;
pub mod verdict;

// Intentionally curated re-exports for downstream consumers.
pub use error::{ModelError, Result as ModelResult};
pub use heat::HeatLevel;
pub use ids::{NodeId, PolicyId, QuarantineId, RequestId, RunId, SeasonId, TemplateId};
pub use node::{Capacity, HeartbeatPayload, NodeStatus, QUARANTINE_LABEL};
pub use policy::{NetworkClass, RetentionPolicy, SandboxPolicy};
pub use quarantine::{
    IsolationConfig, IsolationOverride, NetworkMode, QuarantineRecord, QuarantineStatus,
    ReleaseApproval, SeccompProfile,
};
pub use request::{ResourceSpec, SandboxRequest, metadata_keys};
pub use run::{RunStatus, SandboxRun};
pub use season::{
    HibernationConfig, PrewarmConfig, Season, SeasonSchedule, TimeRange, WakeTrigger,
};
pub use template::Template;
pub use usage::UsageRecord;
pub use verdict::Verdict;
