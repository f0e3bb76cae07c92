use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Per-request audit ledger: every candidate the planner considered, in
/// attempt order, with its outcome.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_candidates")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub request_id: String,
    pub attempt_no: i32,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub credential_id: i64,
    /// "selected" | "skipped" | "failed"
    pub status: String,
    pub skip_reason: Option<String>,
    pub error_category: Option<String>,
    pub latency_ms: Option<i64>,
    pub observed_concurrency: Option<i32>,
    pub created_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
