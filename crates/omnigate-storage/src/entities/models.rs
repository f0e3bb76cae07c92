use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Provider-specific realization of a GlobalModel.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "models")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub global_model_id: i64,
    pub provider_id: i64,
    pub upstream_name: String,
    /// Ordered alternates `[{name, priority, scopes?: ["openai:chat", ...]}]`
    /// for name-rotation load balancing.
    pub name_variants: Option<Json>,
    pub pricing_override: Option<Json>,
    pub capability_override: Option<Json>,
    /// Explicit priority for the planner's first ranking key.
    pub model_priority: Option<i32>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "global_model_id", to = "id", on_delete = "Cascade")]
    pub global_model: HasOne<super::global_models::Entity>,
    #[sea_orm(belongs_to, from = "provider_id", to = "id", on_delete = "Cascade")]
    pub provider: HasOne<super::providers::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
