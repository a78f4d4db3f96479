use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use warden_model::{SandboxPolicy, TemplateId};

use crate::error::{Result, WardenError};

use super::PolicyStore;

/// In-memory policy store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<HashMap<TemplateId, SandboxPolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get_policy(&self, template_id: &TemplateId) -> Result<SandboxPolicy> {
        let policies = self.policies.read().await;
        policies
            .get(template_id)
            .cloned()
            .ok_or_else(|| WardenError::PolicyRejected {
                reason: format!("no policy registered for template {template_id}"),
            })
    }

    async fn upsert_policy(&self, mut policy: SandboxPolicy) -> Result<SandboxPolicy> {
        let mut policies = self.policies.write().await;
        let stored_version = policies.get(&policy.template_id).map(|p| p.version);

        match stored_version {
            None if policy.version == 0 => {}
            None => {
                return Err(WardenError::ConflictingVersion {
                    expected: policy.version,
                    actual: 0,
                });
            }
            Some(actual) if actual == policy.version => {}
            Some(actual) => {
                return Err(WardenError::ConflictingVersion {
                    expected: policy.version,
                    actual,
                });
            }
        }

        policy.version += 1;
        policies.insert(policy.template_id.clone(), policy.clone());
        Ok(policy)
    }
}
