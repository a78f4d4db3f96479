//! Versioned per-template admission policies with optimistic concurrency.

use async_trait::async_trait;

use warden_model::{SandboxPolicy, TemplateId};

use crate::error::Result;

mod memory;
mod redis;

pub use self::memory::InMemoryPolicyStore;
pub use self::redis::RedisPolicyStore;

/// Policy storage. `upsert` requires the caller to present the version it
/// observed; a mismatch returns [`ConflictingVersion`](crate::error::WardenError::ConflictingVersion)
/// and leaves the stored record untouched. On success the stored version
/// is incremented. Callers that do not care about conflicts read first.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_policy(&self, template_id: &TemplateId) -> Result<SandboxPolicy>;

    async fn upsert_policy(&self, policy: SandboxPolicy) -> Result<SandboxPolicy>;
}
