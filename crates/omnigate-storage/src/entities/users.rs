use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    /// sha256 of the user credential.
    pub key_hash: Option<String>,
    /// "admin" | "user"
    pub role: String,
    pub quota_usd: Option<f64>,
    pub used_usd: f64,
    pub total_usd: f64,
    /// Allow-lists; NULL means unrestricted.
    pub allowed_providers: Option<Json>,
    pub allowed_endpoints: Option<Json>,
    pub allowed_models: Option<Json>,
    pub is_deleted: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
