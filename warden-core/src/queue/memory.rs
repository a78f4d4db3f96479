//! In-memory queue with the same observable semantics as the stream-backed
//! implementation. Used by tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use warden_model::SandboxRequest;

use crate::error::{Result, WardenError};
use crate::metrics::{LogMetrics, MetricsSink};

use super::{
    DATA_FIELD, DeadLetterEntry, DeadLetterSink, Receipt, WorkQueue, WorkQueueConfig,
    decode_fields, encode_request, metric,
};

#[derive(Debug, Clone)]
struct StoredEntry {
    id: String,
    fields: HashMap<String, String>,
}

#[derive(Debug, Default)]
struct QueueState {
    streams: HashMap<String, VecDeque<StoredEntry>>,
    pending: HashMap<String, StoredEntry>,
    dlq: Vec<DeadLetterEntry>,
    next_id: u64,
}

impl QueueState {
    fn fresh_id(&mut self) -> String {
        self.next_id += 1;
        format!("mem-{}", self.next_id)
    }

    fn push(&mut self, key: &str, fields: HashMap<String, String>) -> String {
        let id = self.fresh_id();
        self.streams
            .entry(key.to_string())
            .or_default()
            .push_back(StoredEntry {
                id: id.clone(),
                fields,
            });
        id
    }
}

pub struct InMemoryWorkQueue {
    config: WorkQueueConfig,
    metrics: Arc<dyn MetricsSink>,
    dlq_sink: Option<Arc<dyn DeadLetterSink>>,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl std::fmt::Debug for InMemoryWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryWorkQueue")
            .field("stream_key", &self.config.stream_key)
            .finish()
    }
}

impl InMemoryWorkQueue {
    pub fn new(config: WorkQueueConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(LogMetrics),
            dlq_sink: None,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_dlq_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dlq_sink = Some(sink);
        self
    }

    /// Test hook: append a raw payload under the `data` field, bypassing
    /// request encoding. This is how corrupt payloads enter in tests.
    pub async fn inject_payload(&self, raw: impl Into<String>) {
        let fields = HashMap::from([(DATA_FIELD.to_string(), raw.into())]);
        let key = self.config.stream_key.clone();
        let mut state = self.state.lock().await;
        state.push(&key, fields);
        drop(state);
        self.notify.notify_one();
    }

    /// Test hook: append an entry with arbitrary fields.
    pub async fn inject_fields(&self, fields: HashMap<String, String>) {
        let key = self.config.stream_key.clone();
        let mut state = self.state.lock().await;
        state.push(&key, fields);
        drop(state);
        self.notify.notify_one();
    }

    /// Backlog length of an arbitrary key; lets tests observe routing.
    pub async fn depth_of(&self, key: &str) -> u64 {
        let state = self.state.lock().await;
        state.streams.get(key).map(|q| q.len() as u64).unwrap_or(0)
    }

    async fn quarantine_poison(&self, entry: StoredEntry, reason: &'static str) {
        let dlq_entry = DeadLetterEntry {
            error_reason: reason.to_string(),
            original_id: entry.id.clone(),
            dlq_timestamp: Utc::now(),
            payload: entry.fields.get(DATA_FIELD).cloned(),
        };

        {
            let mut state = self.state.lock().await;
            state.dlq.push(dlq_entry.clone());
        }
        self.metrics
            .incr(&format!("{}{}", metric::POISONED_PREFIX, reason), 1);

        // Sink failures must not prevent the move; the entry is already
        // in the DLQ by the time the sink runs.
        if let Some(sink) = &self.dlq_sink
            && let Err(error) = sink.record(&dlq_entry).await
        {
            warn!(%error, original_id = %dlq_entry.original_id, "dead-letter sink write failed");
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, request: &SandboxRequest) -> Result<()> {
        let key = self.config.routed_key(request);
        let fields = HashMap::from([(DATA_FIELD.to_string(), encode_request(request)?)]);

        let mut state = self.state.lock().await;
        state.push(&key, fields);
        drop(state);

        self.metrics.incr(metric::ENQUEUED, 1);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<(SandboxRequest, Receipt)> {
        loop {
            if cancel.is_cancelled() {
                return Err(WardenError::Cancelled("dequeue".to_string()));
            }

            // Register interest before checking so a concurrent enqueue
            // cannot slip between the check and the wait.
            let notified = self.notify.notified();

            let popped = {
                let mut state = self.state.lock().await;
                let key = self.config.stream_key.clone();
                state
                    .streams
                    .get_mut(&key)
                    .and_then(|queue| queue.pop_front())
            };

            match popped {
                Some(entry) => match decode_fields(&entry.fields) {
                    Ok(request) => {
                        let receipt = Receipt(entry.id.clone());
                        let mut state = self.state.lock().await;
                        state.pending.insert(entry.id.clone(), entry);
                        drop(state);
                        self.metrics.incr(metric::DEQUEUED, 1);
                        return Ok((request, receipt));
                    }
                    Err(poison) => {
                        self.quarantine_poison(entry, poison.as_str()).await;
                        // Wake any sibling consumer that raced us here.
                        self.notify.notify_one();
                    }
                },
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(WardenError::Cancelled("dequeue".to_string()));
                        }
                        _ = notified => {}
                    }
                }
            }
        }
    }

    async fn ack(&self, receipt: &Receipt) -> Result<()> {
        let mut state = self.state.lock().await;
        state.pending.remove(&receipt.0);
        Ok(())
    }

    async fn nack(&self, receipt: &Receipt, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.pending.remove(&receipt.0) else {
            warn!(receipt = %receipt, "nack for unknown receipt ignored");
            return Ok(());
        };

        let mut fields = entry.fields;
        fields.insert("nack_reason".to_string(), reason.to_string());
        let key = self.config.stream_key.clone();
        state.push(&key, fields);
        drop(state);

        self.metrics.incr(metric::NACKED, 1);
        self.notify.notify_one();
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        Ok(self.depth_of(&self.config.stream_key).await)
    }

    async fn pending_count(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.pending.len() as u64)
    }

    async fn dlq_depth(&self) -> Result<u64> {
        let state = self.state.lock().await;
        Ok(state.dlq.len() as u64)
    }
}
