use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Async job record linking a Usage row to an upstream job handle.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "video_tasks")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "video_task_request_id")]
    pub request_id: String,
    pub external_task_id: String,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub credential_id: i64,
    pub model: String,
    /// "submitted" | "processing" | "completed" | "failed"
    pub status: String,
    pub poll_count: i32,
    pub max_poll_count: i32,
    pub poll_interval_seconds: i64,
    pub retry_count: i32,
    pub next_poll_at: OffsetDateTime,
    pub progress: Option<f64>,
    pub result_urls: Option<Json>,
    pub result_expires_at: Option<OffsetDateTime>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub raw_response: Option<Json>,
    /// Billing rule frozen at submission.
    pub rule_snapshot: Option<Json>,
    pub submitted_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
