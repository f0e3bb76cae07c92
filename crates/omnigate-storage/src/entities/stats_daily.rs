use sea_orm::entity::prelude::*;
use time::{Date, OffsetDateTime};

/// Daily usage aggregation, one row per (day, provider, model).
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "stats_daily")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "stats_daily_scope")]
    pub day: Date,
    #[sea_orm(unique_key = "stats_daily_scope")]
    pub provider: String,
    #[sea_orm(unique_key = "stats_daily_scope")]
    pub model: String,
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    /// `{error_category: count}` breakdown.
    pub error_breakdown: Option<Json>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_cost_usd: f64,
    /// Set once the day can no longer receive late events.
    pub complete: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
