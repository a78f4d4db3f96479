//! Classification and custody of risky requests: isolation enforcement,
//! release approvals, audit trail.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use warden_model::{
    IsolationConfig, QuarantineId, QuarantineRecord, QuarantineStatus, ReleaseApproval,
    SandboxRequest,
};

use crate::error::{Result, WardenError};
use crate::judge::QuarantineRule;
use crate::judge::auto_quarantine::evaluate_rules;

mod redis;

pub use self::redis::RedisQuarantineStore;

/// One audit-trail event. Where these land (file, SIEM, syslog) is an
/// integrator concern.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: String,
    pub subject: String,
    pub actor: String,
    pub detail: String,
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// Default sink: audit events land in the structured log stream.
#[derive(Debug, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, event: AuditEvent) -> anyhow::Result<()> {
        info!(
            action = %event.action,
            subject = %event.subject,
            actor = %event.actor,
            detail = %event.detail,
            "audit"
        );
        Ok(())
    }
}

/// Storage for quarantine records.
#[async_trait]
pub trait QuarantineStore: Send + Sync {
    async fn insert(&self, record: QuarantineRecord) -> Result<()>;

    async fn get(&self, id: &QuarantineId) -> Result<QuarantineRecord>;

    async fn update(&self, record: &QuarantineRecord) -> Result<()>;

    async fn list(&self, filter: Option<QuarantineStatus>) -> Result<Vec<QuarantineRecord>>;
}

/// In-memory record store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryQuarantineStore {
    records: RwLock<HashMap<QuarantineId, QuarantineRecord>>,
}

#[async_trait]
impl QuarantineStore for InMemoryQuarantineStore {
    async fn insert(&self, record: QuarantineRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, id: &QuarantineId) -> Result<QuarantineRecord> {
        let records = self.records.read().await;
        records
            .get(id)
            .cloned()
            .ok_or(WardenError::QuarantineNotFound(*id))
    }

    async fn update(&self, record: &QuarantineRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if !records.contains_key(&record.id) {
            return Err(WardenError::QuarantineNotFound(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn list(&self, filter: Option<QuarantineStatus>) -> Result<Vec<QuarantineRecord>> {
        let records = self.records.read().await;
        let mut out: Vec<QuarantineRecord> = records
            .values()
            .filter(|r| filter.is_none_or(|status| r.status == status))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }
}

/// Wraps the record store with rule evaluation, the default isolation
/// config, and the release-approval workflow.
pub struct QuarantineManager {
    store: Arc<dyn QuarantineStore>,
    rules: Vec<QuarantineRule>,
    default_isolation: IsolationConfig,
    audit: Option<Arc<dyn AuditSink>>,
}

impl std::fmt::Debug for QuarantineManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuarantineManager")
            .field("rule_count", &self.rules.len())
            .field("default_isolation", &self.default_isolation)
            .finish()
    }
}

impl QuarantineManager {
    pub fn new(store: Arc<dyn QuarantineStore>, rules: Vec<QuarantineRule>) -> Self {
        Self {
            store,
            rules,
            default_isolation: IsolationConfig::default(),
            audit: None,
        }
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    /// Evaluate the declarative rules; the same set the auto-quarantine
    /// judge runs during admission.
    pub fn classify(&self, request: &SandboxRequest) -> (bool, Option<String>, Vec<String>) {
        let evidence = evaluate_rules(&self.rules, request);
        if evidence.is_empty() {
            (false, None, evidence)
        } else {
            (
                true,
                Some("request matched quarantine rules".to_string()),
                evidence,
            )
        }
    }

    /// Persist an Active quarantine record for the request.
    pub async fn quarantine(&self, request: &SandboxRequest) -> Result<QuarantineRecord> {
        let (_, reason, evidence) = self.classify(request);
        let reason = reason.unwrap_or_else(|| "manually quarantined".to_string());
        let record = QuarantineRecord::active(request.id, reason, evidence);
        self.store.insert(record.clone()).await?;

        info!(quarantine = %record.id, request = %request.id, "request quarantined");
        self.audit_event(AuditEvent {
            action: "quarantine".to_string(),
            subject: record.id.to_string(),
            actor: "system".to_string(),
            detail: record.reason.clone(),
        })
        .await;
        Ok(record)
    }

    /// Release a record under an approval. Overrides are validated (each
    /// needs a justification), applied to a copy of the default isolation
    /// config, and audit-logged one by one.
    pub async fn release(
        &self,
        id: &QuarantineId,
        approval: ReleaseApproval,
    ) -> Result<(QuarantineRecord, IsolationConfig)> {
        if approval.justification.trim().is_empty() {
            return Err(WardenError::InvalidConfig(
                "release approval requires a justification".to_string(),
            ));
        }
        for override_ in &approval.overrides {
            override_.validate()?;
        }

        let mut record = self.store.get(id).await?;
        if record.status == QuarantineStatus::Released {
            return Err(WardenError::Internal(format!(
                "quarantine record {id} is already released"
            )));
        }

        let mut isolation = self.default_isolation.clone();
        for override_ in &approval.overrides {
            override_.apply(&mut isolation);
            self.audit_event(AuditEvent {
                action: "isolation-override".to_string(),
                subject: id.to_string(),
                actor: approval.approver.clone(),
                detail: format!("{override_:?}"),
            })
            .await;
        }

        record.status = QuarantineStatus::Released;
        record.updated_at = Utc::now();
        record.release = Some(approval.clone());
        self.store.update(&record).await?;

        info!(quarantine = %id, approver = %approval.approver, "quarantine released");
        self.audit_event(AuditEvent {
            action: "release".to_string(),
            subject: id.to_string(),
            actor: approval.approver,
            detail: approval.justification,
        })
        .await;

        Ok((record, isolation))
    }

    pub async fn list(&self, filter: Option<QuarantineStatus>) -> Result<Vec<QuarantineRecord>> {
        self.store.list(filter).await
    }

    /// The default isolation applied to quarantined sandboxes. Overrides
    /// mutate only the copies handed out by `release`.
    pub fn isolation_config(&self) -> IsolationConfig {
        self.default_isolation.clone()
    }

    async fn audit_event(&self, event: AuditEvent) {
        if let Some(sink) = &self.audit
            && let Err(error) = sink.record(event).await
        {
            warn!(%error, "audit sink write failed");
        }
    }
}
