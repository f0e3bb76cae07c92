use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// A billing formula scoped to (model, task_type) or (global_model,
/// task_type). Storage keeps at most one enabled rule per scope (partial
/// unique index); `find_rule` prefers the Model-level one.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "billing_rules")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub global_model_id: Option<i64>,
    pub model_id: Option<i64>,
    pub task_type: String,
    pub expression: String,
    pub constants: Option<Json>,
    pub dimension_mappings: Option<Json>,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
