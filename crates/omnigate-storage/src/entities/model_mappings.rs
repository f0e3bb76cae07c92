use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Rewrites an incoming model name to a target GlobalModel.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "model_mappings")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub source_name: String,
    pub target_global_model_id: i64,
    /// Optional provider scope; NULL applies everywhere.
    pub provider_id: Option<i64>,
    /// "alias" | "override"
    pub mapping_kind: String,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(
        belongs_to,
        from = "target_global_model_id",
        to = "id",
        on_delete = "Cascade"
    )]
    pub target_global_model: HasOne<super::global_models::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
