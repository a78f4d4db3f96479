//! Stream-backed queue on Redis consumer groups. Delivery receipts are
//! stream entry IDs; the nack and dead-letter paths run as server-side
//! scripts so a crash mid-operation cannot lose or duplicate a message.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Script};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_model::SandboxRequest;

use crate::error::{Result, WardenError};
use crate::metrics::{LogMetrics, MetricsSink};

use super::{
    DATA_FIELD, DeadLetterEntry, DeadLetterSink, PoisonReason, Receipt, WorkQueue,
    WorkQueueConfig, decode_fields, encode_request, metric,
};

/// How long one blocking read waits before re-checking cancellation.
const BLOCK_MILLIS: usize = 1000;

mod scripts {
    use redis::Script;

    /// Atomic negative-acknowledge: re-publish the payload at the tail,
    /// then retire the old delivery. All-or-nothing.
    pub fn nack() -> Script {
        Script::new(
            r#"
            local entries = redis.call('XRANGE', KEYS[1], ARGV[2], ARGV[2])
            if #entries == 0 then
                return 0
            end
            local fields = entries[1][2]
            local args = {'nack_reason', ARGV[3]}
            for i = 1, #fields, 2 do
                if fields[i] ~= 'nack_reason' then
                    table.insert(args, fields[i])
                    table.insert(args, fields[i + 1])
                end
            end
            redis.call('XADD', KEYS[1], '*', unpack(args))
            redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
            redis.call('XDEL', KEYS[1], ARGV[2])
            return 1
            "#,
        )
    }

    /// Atomic dead-letter move: write the annotated entry to the DLQ
    /// stream and ack the original in one step.
    pub fn dead_letter() -> Script {
        Script::new(
            r#"
            redis.call('XADD', KEYS[2], '*',
                'error_reason', ARGV[3],
                'original_id', ARGV[2],
                'dlq_timestamp', ARGV[4],
                'payload', ARGV[5])
            redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
            redis.call('XDEL', KEYS[1], ARGV[2])
            return 1
            "#,
        )
    }
}

pub struct RedisWorkQueue {
    conn: ConnectionManager,
    config: WorkQueueConfig,
    metrics: Arc<dyn MetricsSink>,
    dlq_sink: Option<Arc<dyn DeadLetterSink>>,
    nack_script: Script,
    dlq_script: Script,
}

impl std::fmt::Debug for RedisWorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisWorkQueue")
            .field("stream_key", &self.config.stream_key)
            .field("consumer_group", &self.config.consumer_group)
            .field("consumer_name", &self.config.consumer_name)
            .finish()
    }
}

impl RedisWorkQueue {
    pub async fn new(redis_url: &str, config: WorkQueueConfig) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Self::with_connection(conn, config).await
    }

    pub async fn with_connection(conn: ConnectionManager, config: WorkQueueConfig) -> Result<Self> {
        if config.stream_key.is_empty() || config.consumer_group.is_empty() {
            return Err(WardenError::InvalidConfig(
                "queue stream_key and consumer_group must be non-empty".to_string(),
            ));
        }

        let queue = Self {
            conn,
            config,
            metrics: Arc::new(LogMetrics),
            dlq_sink: None,
            nack_script: scripts::nack(),
            dlq_script: scripts::dead_letter(),
        };
        queue.ensure_group().await?;
        info!(
            stream = %queue.config.stream_key,
            group = %queue.config.consumer_group,
            "work queue ready"
        );
        Ok(queue)
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_dlq_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dlq_sink = Some(sink);
        self
    }

    async fn ensure_group(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(
                &self.config.stream_key,
                &self.config.consumer_group,
                "$",
            )
            .await;
        match created {
            Ok(()) => Ok(()),
            // Group already exists; fine, another consumer got there first.
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn stringify_fields(entry: &redis::streams::StreamId) -> HashMap<String, String> {
        entry
            .map
            .iter()
            .filter_map(|(key, value)| {
                redis::from_redis_value::<String>(value.clone())
                    .ok()
                    .map(|v| (key.clone(), v))
            })
            .collect()
    }

    async fn move_to_dlq(&self, id: &str, fields: &HashMap<String, String>, poison: PoisonReason) {
        let dlq_entry = DeadLetterEntry {
            error_reason: poison.as_str().to_string(),
            original_id: id.to_string(),
            dlq_timestamp: Utc::now(),
            payload: fields.get(DATA_FIELD).cloned(),
        };

        let mut conn = self.conn.clone();
        let moved: std::result::Result<i64, redis::RedisError> = self
            .dlq_script
            .key(&self.config.stream_key)
            .key(self.config.dlq_key())
            .arg(&self.config.consumer_group)
            .arg(id)
            .arg(&dlq_entry.error_reason)
            .arg(dlq_entry.dlq_timestamp.timestamp())
            .arg(dlq_entry.payload.as_deref().unwrap_or(""))
            .invoke_async(&mut conn)
            .await;

        match moved {
            Ok(_) => {
                self.metrics.incr(
                    &format!("{}{}", metric::POISONED_PREFIX, poison.as_str()),
                    1,
                );
                debug!(original_id = id, reason = poison.as_str(), "poison moved to DLQ");
            }
            Err(error) => {
                // The entry stays pending; it will be observed again on a
                // pending re-claim and retried.
                warn!(%error, original_id = id, "failed to move poison to DLQ");
                return;
            }
        }

        if let Some(sink) = &self.dlq_sink
            && let Err(error) = sink.record(&dlq_entry).await
        {
            warn!(%error, original_id = %dlq_entry.original_id, "dead-letter sink write failed");
        }
    }

    async fn read_batch(&self) -> Result<Option<redis::streams::StreamId>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(&self.config.consumer_group, &self.config.consumer_name)
            .count(1)
            .block(BLOCK_MILLIS);

        let reply: StreamReadReply = conn
            .xread_options(&[&self.config.stream_key], &[">"], &options)
            .await?;

        Ok(reply
            .keys
            .into_iter()
            .next()
            .and_then(|stream| stream.ids.into_iter().next()))
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, request: &SandboxRequest) -> Result<()> {
        let key = self.config.routed_key(request);
        let payload = encode_request(request)?;

        let mut conn = self.conn.clone();
        let _id: String = conn.xadd(&key, "*", &[(DATA_FIELD, payload.as_str())]).await?;

        self.metrics.incr(metric::ENQUEUED, 1);
        Ok(())
    }

    async fn dequeue(&self, cancel: &CancellationToken) -> Result<(SandboxRequest, Receipt)> {
        loop {
            if cancel.is_cancelled() {
                return Err(WardenError::Cancelled("dequeue".to_string()));
            }

            let entry = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(WardenError::Cancelled("dequeue".to_string()));
                }
                read = self.read_batch() => read?,
            };

            let Some(entry) = entry else {
                // Blocking read timed out; loop to re-check cancellation.
                continue;
            };

            let fields = Self::stringify_fields(&entry);
            match decode_fields(&fields) {
                Ok(request) => {
                    self.metrics.incr(metric::DEQUEUED, 1);
                    return Ok((request, Receipt(entry.id)));
                }
                Err(poison) => {
                    self.move_to_dlq(&entry.id, &fields, poison).await;
                }
            }
        }
    }

    async fn ack(&self, receipt: &Receipt) -> Result<()> {
        let mut conn = self.conn.clone();
        // XACK of an unknown receipt returns 0; that is the store's
        // native no-op semantics and stays silent here.
        let _: (i64, i64) = redis::pipe()
            .atomic()
            .xack(
                &self.config.stream_key,
                &self.config.consumer_group,
                &[receipt.as_str()],
            )
            .xdel(&self.config.stream_key, &[receipt.as_str()])
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn nack(&self, receipt: &Receipt, reason: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let requeued: i64 = self
            .nack_script
            .key(&self.config.stream_key)
            .arg(&self.config.consumer_group)
            .arg(receipt.as_str())
            .arg(reason)
            .invoke_async(&mut conn)
            .await
            .inspect_err(|_| self.metrics.incr(metric::NACK_ERRORS, 1))?;

        if requeued == 0 {
            warn!(receipt = %receipt, "nack for unknown receipt ignored");
        } else {
            self.metrics.incr(metric::NACKED, 1);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn.xlen(&self.config.stream_key).await?;
        self.metrics.gauge(metric::DEPTH, depth as f64);
        Ok(depth)
    }

    async fn pending_count(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let reply: redis::streams::StreamPendingReply = conn
            .xpending(&self.config.stream_key, &self.config.consumer_group)
            .await?;
        Ok(reply.count() as u64)
    }

    async fn dlq_depth(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let depth: u64 = conn.xlen(self.config.dlq_key()).await?;
        self.metrics.gauge(metric::DLQ_DEPTH, depth as f64);
        Ok(depth)
    }
}
