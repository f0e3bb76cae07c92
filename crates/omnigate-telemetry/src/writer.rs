//! Telemetry writers: the direct writer persists synchronously; the queue
//! writer appends to the durable usage stream for the consumer to apply.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::streams::StreamMaxlen;
use serde_json::Value;
use tracing::error;

use omnigate_common::UsageQueueConfig;
use omnigate_storage::{GatewayStorage, TerminalStatus, UsageRecordInput};

use crate::events::{UsageEvent, UsageEventType};
use crate::masking::{DEFAULT_SENSITIVE_HEADERS, mask_headers, truncate_body};

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("database write failed: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("usage stream unavailable: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// First-byte signal for one streaming request.
#[derive(Debug, Clone)]
pub struct StreamingStarted {
    pub request_id: String,
    pub first_byte_time_ms: i64,
}

#[async_trait]
pub trait TelemetryWriter: Send + Sync {
    async fn streaming_started(&self, event: StreamingStarted) -> Result<(), TelemetryError>;
    async fn record_success(&self, record: UsageRecordInput) -> Result<(), TelemetryError>;
    async fn record_failure(&self, record: UsageRecordInput) -> Result<(), TelemetryError>;
    async fn record_cancelled(&self, record: UsageRecordInput) -> Result<(), TelemetryError>;
}

/// Persists through the storage crate on the caller's task.
pub struct DirectTelemetryWriter {
    storage: GatewayStorage,
}

impl DirectTelemetryWriter {
    pub fn new(storage: GatewayStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl TelemetryWriter for DirectTelemetryWriter {
    async fn streaming_started(&self, event: StreamingStarted) -> Result<(), TelemetryError> {
        self.storage
            .apply_streaming_event(&event.request_id, event.first_byte_time_ms)
            .await?;
        Ok(())
    }

    async fn record_success(&self, record: UsageRecordInput) -> Result<(), TelemetryError> {
        self.storage
            .upsert_terminal_one(&record, TerminalStatus::Completed)
            .await?;
        Ok(())
    }

    async fn record_failure(&self, record: UsageRecordInput) -> Result<(), TelemetryError> {
        self.storage
            .upsert_terminal_one(&record, TerminalStatus::Failed)
            .await?;
        Ok(())
    }

    async fn record_cancelled(&self, record: UsageRecordInput) -> Result<(), TelemetryError> {
        self.storage
            .upsert_terminal_one(&record, TerminalStatus::Cancelled)
            .await?;
        Ok(())
    }
}

/// How much of the exchange the owning API key wants logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Basic,
    Headers,
    Full,
}

impl LogLevel {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "headers" => LogLevel::Headers,
            "full" => LogLevel::Full,
            _ => LogLevel::Basic,
        }
    }

    fn include_headers(&self) -> bool {
        matches!(self, LogLevel::Headers | LogLevel::Full)
    }

    fn include_bodies(&self) -> bool {
        matches!(self, LogLevel::Full)
    }
}

/// Serialises events onto the durable stream; bounded tail latency on the
/// critical path regardless of DB health.
pub struct QueueTelemetryWriter {
    redis: redis::aio::ConnectionManager,
    config: UsageQueueConfig,
    log_level: LogLevel,
    max_request_body_bytes: usize,
    max_response_body_bytes: usize,
}

impl QueueTelemetryWriter {
    pub fn new(
        redis: redis::aio::ConnectionManager,
        config: UsageQueueConfig,
        log_level: LogLevel,
        max_request_body_bytes: usize,
        max_response_body_bytes: usize,
    ) -> Self {
        Self {
            redis,
            config,
            log_level,
            max_request_body_bytes,
            max_response_body_bytes,
        }
    }

    fn scrub(&self, mut record: UsageRecordInput) -> UsageRecordInput {
        if !self.log_level.include_headers() {
            record.request_headers = None;
            record.provider_request_headers = None;
            record.response_headers = None;
            record.client_response_headers = None;
        } else {
            for headers in [
                &mut record.request_headers,
                &mut record.provider_request_headers,
                &mut record.response_headers,
                &mut record.client_response_headers,
            ] {
                if let Some(value) = headers {
                    *value = mask_headers(value, &DEFAULT_SENSITIVE_HEADERS);
                }
            }
        }
        if !self.log_level.include_bodies() {
            record.request_body = None;
            record.provider_request_body = None;
            record.response_body = None;
            record.client_response_body = None;
        } else {
            for body in [&mut record.request_body, &mut record.provider_request_body] {
                if let Some(value) = body {
                    *value = truncate_body(value, self.max_request_body_bytes);
                }
            }
            for body in [&mut record.response_body, &mut record.client_response_body] {
                if let Some(value) = body {
                    *value = truncate_body(value, self.max_response_body_bytes);
                }
            }
        }
        record
    }

    async fn publish(
        &self,
        event_type: UsageEventType,
        request_id: &str,
        payload: Value,
    ) -> Result<(), TelemetryError> {
        let event = UsageEvent::new(event_type, request_id, payload);
        let fields = event.to_stream_fields();
        let mut conn = self.redis.clone();
        let result: Result<String, redis::RedisError> = if self.config.stream_maxlen > 0 {
            conn.xadd_maxlen(
                &self.config.stream_key,
                StreamMaxlen::Approx(self.config.stream_maxlen),
                "*",
                &fields,
            )
            .await
        } else {
            conn.xadd(&self.config.stream_key, "*", &fields).await
        };
        if let Err(err) = &result {
            error!(error = %err, request_id, "usage stream XADD failed");
        }
        result?;
        Ok(())
    }

    async fn publish_record(
        &self,
        event_type: UsageEventType,
        record: UsageRecordInput,
    ) -> Result<(), TelemetryError> {
        let record = self.scrub(record);
        let request_id = record.request_id.clone();
        let payload = serde_json::to_value(&record)?;
        self.publish(event_type, &request_id, payload).await
    }
}

#[async_trait]
impl TelemetryWriter for QueueTelemetryWriter {
    async fn streaming_started(&self, event: StreamingStarted) -> Result<(), TelemetryError> {
        let payload = serde_json::json!({
            "first_byte_time_ms": event.first_byte_time_ms,
        });
        self.publish(UsageEventType::Streaming, &event.request_id, payload)
            .await
    }

    async fn record_success(&self, record: UsageRecordInput) -> Result<(), TelemetryError> {
        self.publish_record(UsageEventType::Completed, record).await
    }

    async fn record_failure(&self, record: UsageRecordInput) -> Result<(), TelemetryError> {
        self.publish_record(UsageEventType::Failed, record).await
    }

    async fn record_cancelled(&self, record: UsageRecordInput) -> Result<(), TelemetryError> {
        self.publish_record(UsageEventType::Cancelled, record).await
    }
}
