//! The orchestrator: runs the judge chain, persists the run, schedules,
//! enqueues, and reconciles registry state against worker reports.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use warden_model::{RunStatus, SandboxRequest, SandboxRun, Verdict};

use crate::error::{Result, WardenError};
use crate::heat::HeatClassifier;
use crate::judge::{AdmissionContext, JudgeChain};
use crate::metrics::{LogMetrics, MetricsSink};
use crate::policy::PolicyStore;
use crate::queue::SharedQueue;
use crate::registry::Registry;
use crate::sched::Scheduler;
use crate::template::TemplateCatalog;

pub mod metric {
    pub const SUBMITTED: &str = "manager.submitted";
    pub const REJECTED: &str = "manager.rejected";
    pub const QUARANTINED: &str = "manager.quarantined";
    pub const SCHEDULED: &str = "manager.scheduled";
    pub const FAILED: &str = "manager.failed";
}

/// Outcome of a reconciliation sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub nodes_checked: usize,
    /// Worker-reported sandboxes with no run record.
    pub unknown_runs: usize,
    /// Worker-reported sandboxes whose run is not in an active state.
    pub mismatched_runs: usize,
    /// Per-node lookup errors (non-fatal).
    pub node_errors: usize,
}

pub struct SubmissionManager {
    templates: Arc<dyn TemplateCatalog>,
    policies: Arc<dyn PolicyStore>,
    judges: JudgeChain,
    heat: Option<Arc<dyn HeatClassifier>>,
    registry: Arc<dyn Registry>,
    scheduler: Scheduler,
    queue: SharedQueue,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for SubmissionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmissionManager")
            .field("judges", &self.judges)
            .field("scheduler", &self.scheduler)
            .field("heat_classifier", &self.heat.is_some())
            .finish()
    }
}

impl SubmissionManager {
    pub fn new(
        templates: Arc<dyn TemplateCatalog>,
        policies: Arc<dyn PolicyStore>,
        judges: JudgeChain,
        registry: Arc<dyn Registry>,
        scheduler: Scheduler,
        queue: SharedQueue,
    ) -> Self {
        Self {
            templates,
            policies,
            judges,
            heat: None,
            registry,
            scheduler,
            queue,
            metrics: Arc::new(LogMetrics),
        }
    }

    pub fn with_heat_classifier(mut self, classifier: Arc<dyn HeatClassifier>) -> Self {
        self.heat = Some(classifier);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Admit, place, and dispatch one submission.
    ///
    /// Admission failures (unknown template, policy rejection) surface
    /// before any run is persisted. After the Pending run exists, every
    /// failure is recorded on the run best-effort and then surfaced.
    pub async fn submit(&self, mut request: SandboxRequest) -> Result<SandboxRun> {
        self.metrics.incr(metric::SUBMITTED, 1);

        let template = self.templates.get(&request.template_id).await?;
        let policy = self.policies.get_policy(&request.template_id).await?;
        let ctx = AdmissionContext {
            policy: &policy,
            template: &template,
        };

        match self.judges.evaluate(&mut request, &ctx)? {
            Verdict::Reject { reason } => {
                self.metrics.incr(metric::REJECTED, 1);
                info!(request = %request.id, %reason, "submission rejected by policy");
                return Err(WardenError::PolicyRejected { reason });
            }
            Verdict::Quarantine { reason, evidence } => {
                self.metrics.incr(metric::QUARANTINED, 1);
                info!(
                    request = %request.id,
                    %reason,
                    evidence = ?evidence,
                    "submission quarantined"
                );
                request.mark_quarantined();
            }
            Verdict::Accept => {}
        }

        if let Some(classifier) = &self.heat {
            let level = classifier.classify(&request);
            request.heat_level = Some(level);
            debug!(request = %request.id, heat = %level, "heat classified");
        }

        let mut run = SandboxRun::pending(request.id, request.template_id.clone());
        // If the initial persist fails there is nothing to roll back;
        // abort outright.
        self.registry.update_run(&run).await?;

        let nodes = self.registry.list_nodes().await?;
        let node_id = match self.scheduler.schedule(&request, &nodes) {
            Ok(node_id) => node_id,
            Err(err) => {
                self.fail_run(&mut run, err.to_string()).await;
                self.metrics.incr(metric::FAILED, 1);
                return Err(err);
            }
        };

        request.node_id = Some(node_id.clone());
        run.node_id = Some(node_id.clone());
        run.transition(RunStatus::Scheduled)?;
        self.registry.update_run(&run).await?;

        if let Err(err) = self.queue.enqueue(&request).await {
            // The node saw no work but the run reads Scheduled until this
            // write lands; the Failed update is best-effort.
            self.fail_run(&mut run, format!("enqueue failed: {err}")).await;
            self.metrics.incr(metric::FAILED, 1);
            return Err(err);
        }

        self.judges.run_post(&mut request, &ctx);

        self.metrics.incr(metric::SCHEDULED, 1);
        info!(request = %request.id, node = %node_id, "submission scheduled");
        Ok(run)
    }

    /// Cross-check worker-reported sandboxes against the run ledger.
    /// Discrepancies are logged; per-node errors are non-fatal. Only a
    /// global listing failure surfaces as an error.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let nodes = match self.registry.list_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                error!(error = %err, "reconcile: node listing failed");
                return Err(err);
            }
        };

        let mut report = ReconcileReport::default();
        for node in &nodes {
            report.nodes_checked += 1;
            for run_id in &node.active_sandboxes {
                match self.registry.get_run(run_id).await {
                    Ok(run) if matches!(
                        run.status,
                        RunStatus::Running | RunStatus::Scheduled | RunStatus::Hibernated
                    ) => {}
                    Ok(run) => {
                        warn!(
                            node = %node.id,
                            run = %run_id,
                            status = %run.status,
                            "reconcile: worker reports a sandbox whose run is not active"
                        );
                        report.mismatched_runs += 1;
                    }
                    Err(WardenError::RunNotFound(_)) => {
                        warn!(
                            node = %node.id,
                            run = %run_id,
                            "reconcile: worker reports an unknown sandbox"
                        );
                        report.unknown_runs += 1;
                    }
                    Err(err) => {
                        warn!(node = %node.id, error = %err, "reconcile: run lookup failed");
                        report.node_errors += 1;
                    }
                }
            }
        }

        info!(
            nodes = report.nodes_checked,
            unknown = report.unknown_runs,
            mismatched = report.mismatched_runs,
            errors = report.node_errors,
            "reconcile complete"
        );
        Ok(report)
    }

    async fn fail_run(&self, run: &mut SandboxRun, reason: String) {
        if let Err(transition_err) = run.fail(reason.clone()) {
            warn!(run = %run.id, error = %transition_err, "could not mark run failed");
            return;
        }
        if let Err(store_err) = self.registry.update_run(run).await {
            warn!(
                run = %run.id,
                error = %store_err,
                "failed to persist Failed status; run reads stale until retried"
            );
        }
    }
}
