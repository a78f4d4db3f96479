//! Declarative quarantine predicates. The judge and the quarantine
//! manager's classifier evaluate the same rule set, so admission and
//! after-the-fact classification cannot drift apart.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use warden_model::{SandboxRequest, Verdict};

use crate::error::Result;

use super::{AdmissionContext, Judge};

/// One predicate over a request. A match produces an evidence line
/// naming the rule and the observed value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuarantineRule {
    CpuAbove { millis: u64 },
    MemoryAbove { mb: u64 },
    TtlAbove {
        #[serde(with = "ttl_secs")]
        ttl: Duration,
    },
    MetadataEquals { key: String, value: String },
}

mod ttl_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(de)?))
    }
}

impl QuarantineRule {
    /// Evidence line when the request matches, None otherwise.
    pub fn matches(&self, request: &SandboxRequest) -> Option<String> {
        match self {
            Self::CpuAbove { millis } if request.resources.cpu_millis > *millis => Some(format!(
                "cpu {}m exceeds quarantine threshold {}m",
                request.resources.cpu_millis, millis
            )),
            Self::MemoryAbove { mb } if request.resources.memory_mb > *mb => Some(format!(
                "memory {}MB exceeds quarantine threshold {}MB",
                request.resources.memory_mb, mb
            )),
            Self::TtlAbove { ttl } if request.resources.ttl > *ttl => Some(format!(
                "ttl {}s exceeds quarantine threshold {}s",
                request.resources.ttl.as_secs(),
                ttl.as_secs()
            )),
            Self::MetadataEquals { key, value }
                if request.metadata.get(key).is_some_and(|v| v == value) =>
            {
                Some(format!("metadata {key}={value}"))
            }
            _ => None,
        }
    }
}

/// Evaluate every rule and gather the evidence bundle.
pub(crate) fn evaluate_rules(
    rules: &[QuarantineRule],
    request: &SandboxRequest,
) -> Vec<String> {
    rules.iter().filter_map(|r| r.matches(request)).collect()
}

/// Emits Quarantine when any declarative predicate matches the request.
#[derive(Debug, Default)]
pub struct AutoQuarantineJudge {
    rules: Vec<QuarantineRule>,
}

impl AutoQuarantineJudge {
    pub fn new(rules: Vec<QuarantineRule>) -> Self {
        Self { rules }
    }
}

impl Judge for AutoQuarantineJudge {
    fn name(&self) -> &'static str {
        "auto-quarantine"
    }

    fn judge(&self, request: &mut SandboxRequest, _ctx: &AdmissionContext<'_>) -> Result<Verdict> {
        let evidence = evaluate_rules(&self.rules, request);
        if evidence.is_empty() {
            return Ok(Verdict::Accept);
        }
        Ok(Verdict::quarantine(
            "request matched quarantine rules",
            evidence,
        ))
    }
}

#[cfg(test)]
mod tests {
    use warden_model::{ResourceSpec, SandboxPolicy, Template, TemplateId};

    use super::*;

    fn fixtures(cpu: u64) -> (SandboxRequest, SandboxPolicy, Template) {
        let template_id = TemplateId::from("t");
        let request = SandboxRequest::new(
            template_id.clone(),
            ResourceSpec::new(cpu, 64, Duration::from_secs(30)),
        );
        let policy = SandboxPolicy::new(
            template_id.clone(),
            ResourceSpec::new(8000, 8192, Duration::from_secs(600)),
        );
        let template = Template::new(template_id, "alpine:3");
        (request, policy, template)
    }

    #[test]
    fn matching_rules_build_an_evidence_bundle() {
        let (mut request, policy, template) = fixtures(4000);
        request
            .metadata
            .insert("origin".to_string(), "untrusted".to_string());

        let judge = AutoQuarantineJudge::new(vec![
            QuarantineRule::CpuAbove { millis: 3000 },
            QuarantineRule::MetadataEquals {
                key: "origin".to_string(),
                value: "untrusted".to_string(),
            },
            QuarantineRule::MemoryAbove { mb: 100_000 },
        ]);
        let ctx = AdmissionContext {
            policy: &policy,
            template: &template,
        };
        match judge.judge(&mut request, &ctx).unwrap() {
            Verdict::Quarantine { evidence, .. } => assert_eq!(evidence.len(), 2),
            other => panic!("expected quarantine, got {other:?}"),
        }
    }

    #[test]
    fn no_match_accepts() {
        let (mut request, policy, template) = fixtures(100);
        let judge = AutoQuarantineJudge::new(vec![QuarantineRule::CpuAbove { millis: 3000 }]);
        let ctx = AdmissionContext {
            policy: &policy,
            template: &template,
        };
        assert_eq!(judge.judge(&mut request, &ctx).unwrap(), Verdict::Accept);
    }
}
