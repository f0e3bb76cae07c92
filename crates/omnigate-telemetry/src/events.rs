//! Usage event encoding for the durable stream.
//!
//! One stream entry carries `{event_type, request_id, ts_ms, payload_json}`.

use redis::streams::StreamId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UsageEventType {
    /// First byte observed; updates an existing row in place.
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl UsageEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageEventType::Streaming => "STREAMING",
            UsageEventType::Completed => "COMPLETED",
            UsageEventType::Failed => "FAILED",
            UsageEventType::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "STREAMING" => Some(UsageEventType::Streaming),
            "COMPLETED" => Some(UsageEventType::Completed),
            "FAILED" => Some(UsageEventType::Failed),
            "CANCELLED" => Some(UsageEventType::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, UsageEventType::Streaming)
    }
}

#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub event_type: UsageEventType,
    pub request_id: String,
    pub ts_ms: i64,
    pub payload: Value,
}

impl UsageEvent {
    pub fn new(event_type: UsageEventType, request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type,
            request_id: request_id.into(),
            ts_ms: (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
            payload,
        }
    }

    pub fn to_stream_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("event_type", self.event_type.as_str().to_string()),
            ("request_id", self.request_id.clone()),
            ("ts_ms", self.ts_ms.to_string()),
            ("payload_json", self.payload.to_string()),
        ]
    }

    pub fn from_stream_entry(entry: &StreamId) -> Result<Self, String> {
        let event_type: String = entry
            .get("event_type")
            .ok_or_else(|| "missing event_type".to_string())?;
        let event_type = UsageEventType::parse(&event_type)
            .ok_or_else(|| format!("unknown event_type: {event_type}"))?;
        let request_id: String = entry
            .get("request_id")
            .ok_or_else(|| "missing request_id".to_string())?;
        let ts_ms: String = entry.get("ts_ms").unwrap_or_default();
        let payload_json: String = entry
            .get("payload_json")
            .ok_or_else(|| "missing payload_json".to_string())?;
        let payload: Value =
            serde_json::from_str(&payload_json).map_err(|err| format!("bad payload: {err}"))?;
        Ok(Self {
            event_type,
            request_id,
            ts_ms: ts_ms.parse().unwrap_or(0),
            payload,
        })
    }
}

/// Idempotently create the consumer group (BUSYGROUP tolerated).
pub async fn ensure_stream_group(
    conn: &mut redis::aio::ConnectionManager,
    stream_key: &str,
    group: &str,
) -> Result<(), redis::RedisError> {
    let created: Result<(), redis::RedisError> = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(stream_key)
        .arg(group)
        .arg("0-0")
        .arg("MKSTREAM")
        .query_async(conn)
        .await;
    match created {
        Ok(()) => Ok(()),
        Err(err) if err.to_string().contains("BUSYGROUP") => Ok(()),
        Err(err) => Err(err),
    }
}
