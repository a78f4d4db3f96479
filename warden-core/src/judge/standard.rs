//! The stock admission judges: resource ceilings, network allow/deny,
//! audit stamping.

use std::collections::HashSet;

use uuid::Uuid;

use warden_model::{SandboxRequest, Verdict, metadata_keys};

use crate::error::Result;

use super::{AdmissionContext, Judge};

/// Rejects requests whose resource spec exceeds the template policy's
/// ceilings on any tracked dimension.
#[derive(Debug, Default)]
pub struct ResourceJudge;

impl Judge for ResourceJudge {
    fn name(&self) -> &'static str {
        "resource"
    }

    fn judge(&self, request: &mut SandboxRequest, ctx: &AdmissionContext<'_>) -> Result<Verdict> {
        let ceilings = &ctx.policy.ceilings;
        let resources = &request.resources;

        let violation = if resources.cpu_millis > ceilings.cpu_millis {
            Some(format!(
                "cpu {}m exceeds ceiling {}m",
                resources.cpu_millis, ceilings.cpu_millis
            ))
        } else if resources.memory_mb > ceilings.memory_mb {
            Some(format!(
                "memory {}MB exceeds ceiling {}MB",
                resources.memory_mb, ceilings.memory_mb
            ))
        } else if resources.gpu > ceilings.gpu {
            Some(format!(
                "gpu {} exceeds ceiling {}",
                resources.gpu, ceilings.gpu
            ))
        } else if resources.ttl > ceilings.ttl {
            Some(format!(
                "ttl {}s exceeds ceiling {}s",
                resources.ttl.as_secs(),
                ceilings.ttl.as_secs()
            ))
        } else {
            None
        };

        Ok(match violation {
            Some(reason) => Verdict::reject(reason),
            None => Verdict::Accept,
        })
    }
}

/// Rejects requests referencing a network policy outside the allow-list
/// or inside the deny-list. Requests without a network policy pass.
#[derive(Debug, Default)]
pub struct NetworkJudge {
    allow: HashSet<String>,
    deny: HashSet<String>,
}

impl NetworkJudge {
    pub fn new(
        allow: impl IntoIterator<Item = String>,
        deny: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            allow: allow.into_iter().collect(),
            deny: deny.into_iter().collect(),
        }
    }
}

impl Judge for NetworkJudge {
    fn name(&self) -> &'static str {
        "network"
    }

    fn judge(&self, request: &mut SandboxRequest, _ctx: &AdmissionContext<'_>) -> Result<Verdict> {
        let Some(requested) = &request.network_policy else {
            return Ok(Verdict::Accept);
        };

        if self.deny.contains(requested) {
            return Ok(Verdict::reject(format!(
                "network policy {requested} is denied"
            )));
        }
        if !self.allow.is_empty() && !self.allow.contains(requested) {
            return Ok(Verdict::reject(format!(
                "network policy {requested} is not in the allow-list"
            )));
        }
        Ok(Verdict::Accept)
    }
}

/// Stamps an audit ID and compliance level into the request metadata.
/// Never rejects.
#[derive(Debug)]
pub struct AuditJudge {
    compliance_level: String,
}

impl Default for AuditJudge {
    fn default() -> Self {
        Self {
            compliance_level: "standard".to_string(),
        }
    }
}

impl AuditJudge {
    pub fn with_compliance_level(level: impl Into<String>) -> Self {
        Self {
            compliance_level: level.into(),
        }
    }
}

impl Judge for AuditJudge {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn judge(&self, request: &mut SandboxRequest, _ctx: &AdmissionContext<'_>) -> Result<Verdict> {
        request
            .metadata
            .entry(metadata_keys::AUDIT_ID.to_string())
            .or_insert_with(|| Uuid::new_v4().to_string());
        request.metadata.insert(
            metadata_keys::COMPLIANCE_LEVEL.to_string(),
            self.compliance_level.clone(),
        );
        Ok(Verdict::Accept)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use warden_model::{ResourceSpec, SandboxPolicy, Template, TemplateId};

    use super::*;

    fn fixtures(cpu: u64, mem: u64) -> (SandboxRequest, SandboxPolicy, Template) {
        let template_id = TemplateId::from("hello-world");
        let request = SandboxRequest::new(
            template_id.clone(),
            ResourceSpec::new(cpu, mem, Duration::from_secs(30)),
        );
        let policy = SandboxPolicy::new(
            template_id.clone(),
            ResourceSpec::new(1000, 128, Duration::from_secs(60)),
        );
        let template = Template::new(template_id, "alpine:3");
        (request, policy, template)
    }

    #[test]
    fn resources_within_ceilings_pass() {
        let (mut request, policy, template) = fixtures(500, 64);
        let ctx = AdmissionContext {
            policy: &policy,
            template: &template,
        };
        assert_eq!(
            ResourceJudge.judge(&mut request, &ctx).unwrap(),
            Verdict::Accept
        );
    }

    #[test]
    fn any_dimension_over_ceiling_rejects() {
        let (mut request, policy, template) = fixtures(500, 4096);
        let ctx = AdmissionContext {
            policy: &policy,
            template: &template,
        };
        let verdict = ResourceJudge.judge(&mut request, &ctx).unwrap();
        assert!(verdict.is_reject());
    }

    #[test]
    fn network_deny_list_beats_allow_list() {
        let (mut request, policy, template) = fixtures(500, 64);
        request.network_policy = Some("open".to_string());
        let judge = NetworkJudge::new(vec!["open".to_string()], vec!["open".to_string()]);
        let ctx = AdmissionContext {
            policy: &policy,
            template: &template,
        };
        assert!(judge.judge(&mut request, &ctx).unwrap().is_reject());
    }

    #[test]
    fn network_outside_allow_list_rejects() {
        let (mut request, policy, template) = fixtures(500, 64);
        request.network_policy = Some("exotic".to_string());
        let judge = NetworkJudge::new(vec!["monitored".to_string()], vec![]);
        let ctx = AdmissionContext {
            policy: &policy,
            template: &template,
        };
        assert!(judge.judge(&mut request, &ctx).unwrap().is_reject());
    }

    #[test]
    fn audit_judge_stamps_and_accepts() {
        let (mut request, policy, template) = fixtures(500, 64);
        let ctx = AdmissionContext {
            policy: &policy,
            template: &template,
        };
        let verdict = AuditJudge::default().judge(&mut request, &ctx).unwrap();
        assert_eq!(verdict, Verdict::Accept);
        assert!(request.metadata.contains_key(metadata_keys::AUDIT_ID));
        assert_eq!(
            request.metadata.get(metadata_keys::COMPLIANCE_LEVEL),
            Some(&"standard".to_string())
        );
    }
}
