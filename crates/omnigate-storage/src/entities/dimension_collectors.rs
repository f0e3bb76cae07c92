use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "dimension_collectors")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub api_family: String,
    pub endpoint_kind: String,
    pub task_type: String,
    pub dimension_name: String,
    /// "request" | "response" | "metadata" | "computed"
    pub source_type: String,
    pub source_path: Option<String>,
    /// "float" | "int" | "string"
    pub value_type: String,
    pub transform_expression: Option<String>,
    pub default_value: Option<String>,
    pub required: bool,
    /// Higher wins within one dimension name.
    pub priority: i32,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
