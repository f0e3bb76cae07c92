use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "providers")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "provider_name")]
    pub name: String,
    /// Tag driving provider-specific quirks ("codex", "gemini_cli", ...).
    pub provider_type: Option<String>,
    pub billing_model: Option<String>,
    pub monthly_quota_usd: Option<f64>,
    pub monthly_used_usd: f64,
    pub rpm_limit: Option<i32>,
    pub rpm_used: i32,
    /// Lower = preferred.
    pub provider_priority: i32,
    /// Optional proxy binding (node reference or raw URL).
    pub proxy: Option<Json>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
