use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: Option<i64>,
    #[sea_orm(unique_key = "api_key_key_hash")]
    pub key_hash: String,
    pub label: Option<String>,
    pub is_active: bool,
    pub allowed_providers: Option<Json>,
    pub allowed_endpoints: Option<Json>,
    pub allowed_api_formats: Option<Json>,
    pub allowed_models: Option<Json>,
    pub rate_limit_per_minute: Option<i32>,
    pub max_concurrent: Option<i32>,
    /// "basic" | "headers" | "full" — how much of the exchange enters telemetry.
    pub log_level: String,
    pub used_usd: f64,
    pub request_count: i64,
    pub expires_at: Option<OffsetDateTime>,
    pub auto_delete_on_expiry: bool,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    #[sea_orm(belongs_to, from = "user_id", to = "id", on_delete = "Cascade")]
    pub user: HasOne<super::users::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
