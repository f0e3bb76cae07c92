//! Usage stream consumer: batch reads, grouped application, pipelined ACK,
//! stuck-message auto-claim, and DLQ rerouting.

use std::time::Duration;

use redis::AsyncCommands;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamMaxlen,
    StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use omnigate_common::UsageQueueConfig;
use omnigate_storage::{GatewayStorage, TerminalStatus, UsageRecordInput};

use crate::events::{UsageEvent, UsageEventType, ensure_stream_group};

fn consumer_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
    format!("{host}:{}", std::process::id())
}

pub struct UsageQueueConsumer {
    storage: GatewayStorage,
    redis: redis::aio::ConnectionManager,
    config: UsageQueueConfig,
    consumer: String,
}

impl UsageQueueConsumer {
    pub fn new(
        storage: GatewayStorage,
        redis: redis::aio::ConnectionManager,
        config: UsageQueueConfig,
    ) -> Self {
        Self {
            storage,
            redis,
            config,
            consumer: consumer_name(),
        }
    }

    /// Ensure the group exists, then run until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut conn = self.redis.clone();
            if let Err(err) =
                ensure_stream_group(&mut conn, &self.config.stream_key, &self.config.group).await
            {
                error!(error = %err, "failed to ensure usage stream group");
            }
            info!(consumer = %self.consumer, "usage queue consumer started");
            let mut last_claim = tokio::time::Instant::now() - Duration::from_secs(3600);
            loop {
                if last_claim.elapsed().as_secs() >= self.config.claim_interval_secs {
                    last_claim = tokio::time::Instant::now();
                    if let Err(err) = self.claim_stuck().await {
                        warn!(error = %err, "XAUTOCLAIM pass failed");
                    }
                }
                match self.read_new().await {
                    Ok(()) => {}
                    Err(err) => {
                        warn!(error = %err, "usage consumer read failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    async fn read_new(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.consumer)
            .count(self.config.consumer_batch)
            .block(self.config.block_ms as usize);
        let reply: StreamReadReply = conn
            .xread_options(&[&self.config.stream_key], &[">"], &options)
            .await?;
        for stream in reply.keys {
            self.process_batch(&stream.ids).await?;
        }
        Ok(())
    }

    /// Claim messages idle past the threshold; anything delivered more than
    /// `max_retries` times reroutes to the DLQ.
    async fn claim_stuck(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        let reply: StreamAutoClaimReply = conn
            .xautoclaim_options(
                &self.config.stream_key,
                &self.config.group,
                &self.consumer,
                self.config.claim_idle_ms as usize,
                "0-0",
                StreamAutoClaimOptions::default().count(self.config.consumer_batch),
            )
            .await?;
        if reply.claimed.is_empty() {
            return Ok(());
        }

        // Delivery counts come from XPENDING for the claimed window.
        let first = reply.claimed.first().map(|id| id.id.clone()).unwrap_or_default();
        let last = reply.claimed.last().map(|id| id.id.clone()).unwrap_or_default();
        let pending: StreamPendingCountReply = conn
            .xpending_count(
                &self.config.stream_key,
                &self.config.group,
                &first,
                &last,
                reply.claimed.len(),
            )
            .await?;

        let mut exhausted: Vec<StreamId> = Vec::new();
        let mut retryable: Vec<StreamId> = Vec::new();
        for id in reply.claimed {
            let delivered = pending
                .ids
                .iter()
                .find(|p| p.id == id.id)
                .map(|p| p.times_delivered)
                .unwrap_or(0);
            if delivered > self.config.max_retries as usize {
                exhausted.push(id);
            } else {
                retryable.push(id);
            }
        }

        for id in exhausted {
            self.route_to_dlq(&id, "max retries exceeded").await?;
        }
        if !retryable.is_empty() {
            self.process_batch(&retryable).await?;
        }
        Ok(())
    }

    async fn process_batch(&self, entries: &[StreamId]) -> Result<(), redis::RedisError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut streaming: Vec<(String, UsageEvent)> = Vec::new();
        let mut terminal: Vec<(String, UsageEvent)> = Vec::new();
        let mut malformed: Vec<(StreamId, String)> = Vec::new();

        for entry in entries {
            match UsageEvent::from_stream_entry(entry) {
                Ok(event) if event.event_type.is_terminal() => {
                    terminal.push((entry.id.clone(), event));
                }
                Ok(event) => streaming.push((entry.id.clone(), event)),
                Err(reason) => malformed.push((entry.clone(), reason)),
            }
        }

        let mut acked: Vec<String> = Vec::new();

        // STREAMING events are simple in-place updates, applied one by one.
        for (id, event) in streaming {
            let first_byte = event.payload["first_byte_time_ms"].as_i64().unwrap_or(0);
            match self
                .storage
                .apply_streaming_event(&event.request_id, first_byte)
                .await
            {
                Ok(()) => acked.push(id),
                Err(err) => {
                    warn!(error = %err, request_id = %event.request_id, "STREAMING apply failed");
                }
            }
        }

        // Terminal events go through one bulk upsert.
        if !terminal.is_empty() {
            let mut batch: Vec<(UsageRecordInput, TerminalStatus)> = Vec::new();
            let mut batch_ids: Vec<String> = Vec::new();
            for (id, event) in &terminal {
                match serde_json::from_value::<UsageRecordInput>(event.payload.clone()) {
                    Ok(mut record) => {
                        record.request_id = event.request_id.clone();
                        let status = match event.event_type {
                            UsageEventType::Failed => TerminalStatus::Failed,
                            UsageEventType::Cancelled => TerminalStatus::Cancelled,
                            _ => TerminalStatus::Completed,
                        };
                        batch.push((record, status));
                        batch_ids.push(id.clone());
                    }
                    Err(err) => {
                        self.route_to_dlq_by_event(id, event, &err.to_string()).await?;
                    }
                }
            }
            match self.storage.upsert_terminal_batch(&batch).await {
                Ok(()) => acked.extend(batch_ids),
                Err(err) => {
                    warn!(error = %err, "terminal usage batch failed; leaving pending for retry");
                }
            }
        }

        for (entry, reason) in malformed {
            self.route_to_dlq(&entry, &reason).await?;
        }

        if !acked.is_empty() {
            // One pipelined round-trip for the whole batch.
            let mut conn = self.redis.clone();
            let mut pipeline = redis::pipe();
            for id in &acked {
                pipeline.xack(&self.config.stream_key, &self.config.group, &[id]);
            }
            pipeline.query_async::<()>(&mut conn).await?;
        }
        Ok(())
    }

    async fn route_to_dlq(
        &self,
        entry: &StreamId,
        error_reason: &str,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        let mut fields: Vec<(String, String)> = entry
            .map
            .iter()
            .filter_map(|(key, value)| {
                redis::from_redis_value::<String>(value)
                    .ok()
                    .map(|text| (key.clone(), text))
            })
            .collect();
        fields.push(("source_id".to_string(), entry.id.clone()));
        fields.push(("error".to_string(), error_reason.to_string()));

        let _: String = conn
            .xadd_maxlen(
                &self.config.dlq_key,
                StreamMaxlen::Approx(self.config.dlq_maxlen),
                "*",
                &fields,
            )
            .await?;
        let _: i64 = conn
            .xack(&self.config.stream_key, &self.config.group, &[&entry.id])
            .await?;
        warn!(source_id = %entry.id, error = error_reason, "usage event routed to DLQ");
        Ok(())
    }

    async fn route_to_dlq_by_event(
        &self,
        id: &str,
        event: &UsageEvent,
        error_reason: &str,
    ) -> Result<(), redis::RedisError> {
        let mut conn = self.redis.clone();
        let fields = vec![
            ("event_type".to_string(), event.event_type.as_str().to_string()),
            ("request_id".to_string(), event.request_id.clone()),
            ("payload_json".to_string(), event.payload.to_string()),
            ("source_id".to_string(), id.to_string()),
            ("error".to_string(), error_reason.to_string()),
        ];
        let _: String = conn
            .xadd_maxlen(
                &self.config.dlq_key,
                StreamMaxlen::Approx(self.config.dlq_maxlen),
                "*",
                &fields,
            )
            .await?;
        let _: i64 = conn
            .xack(&self.config.stream_key, &self.config.group, &[id])
            .await?;
        warn!(source_id = id, error = error_reason, "usage event routed to DLQ");
        Ok(())
    }
}
