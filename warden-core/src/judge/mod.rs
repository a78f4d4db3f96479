//! Ordered admission evaluators. Pre-judges run in registration order and
//! compose worst-wins; post-judges run after dispatch for audit and
//! classification and are never in the admission path.

use std::sync::Arc;

use tracing::warn;

use warden_model::{SandboxPolicy, SandboxRequest, Template, Verdict};

use crate::error::Result;

pub(crate) mod auto_quarantine;
mod standard;

pub use auto_quarantine::{AutoQuarantineJudge, QuarantineRule};
pub use standard::{AuditJudge, NetworkJudge, ResourceJudge};

/// Everything a judge may consult besides the request itself.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionContext<'a> {
    pub policy: &'a SandboxPolicy,
    pub template: &'a Template,
}

/// A single admission evaluator. Judges are CPU-only and must not block;
/// an erroring judge is a bug, not a verdict, so errors propagate.
pub trait Judge: Send + Sync {
    fn name(&self) -> &'static str;

    fn judge(&self, request: &mut SandboxRequest, ctx: &AdmissionContext<'_>) -> Result<Verdict>;
}

#[derive(Default)]
pub struct JudgeChain {
    pre: Vec<Arc<dyn Judge>>,
    post: Vec<Arc<dyn Judge>>,
}

impl std::fmt::Debug for JudgeChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JudgeChain")
            .field("pre", &self.pre.iter().map(|j| j.name()).collect::<Vec<_>>())
            .field(
                "post",
                &self.post.iter().map(|j| j.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl JudgeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pre(mut self, judge: Arc<dyn Judge>) -> Self {
        self.pre.push(judge);
        self
    }

    pub fn with_post(mut self, judge: Arc<dyn Judge>) -> Self {
        self.post.push(judge);
        self
    }

    /// Fold the pre-judges worst-wins. Any Reject short-circuits;
    /// Quarantine is sticky over later Accepts.
    pub fn evaluate(
        &self,
        request: &mut SandboxRequest,
        ctx: &AdmissionContext<'_>,
    ) -> Result<Verdict> {
        let mut verdict = Verdict::Accept;
        for judge in &self.pre {
            verdict = verdict.combine(judge.judge(request, ctx)?);
            if verdict.is_reject() {
                break;
            }
        }
        Ok(verdict)
    }

    /// Post-judges are observational; their failures are logged, never
    /// surfaced.
    pub fn run_post(&self, request: &mut SandboxRequest, ctx: &AdmissionContext<'_>) {
        for judge in &self.post {
            if let Err(error) = judge.judge(request, ctx) {
                warn!(judge = judge.name(), %error, "post-judge failed");
            }
        }
    }
}
