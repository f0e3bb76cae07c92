use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_endpoints")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "endpoint_signature")]
    pub provider_id: i64,
    /// "openai" | "claude" | "gemini"
    #[sea_orm(unique_key = "endpoint_signature")]
    pub api_family: String,
    /// "chat" | "cli" | "video" | ...
    #[sea_orm(unique_key = "endpoint_signature")]
    pub endpoint_kind: String,
    pub base_url: String,
    /// Path template overriding the family default ({model} substitution).
    pub custom_path: Option<String>,
    pub custom_headers: Option<Json>,
    pub connect_timeout_ms: Option<i64>,
    pub read_timeout_ms: Option<i64>,
    /// First-byte deadline for streamed calls.
    pub first_byte_timeout_ms: Option<i64>,
    pub proxy: Option<Json>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
