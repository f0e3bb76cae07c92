use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "proxy_node_events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub node_id: i64,
    /// "connected" | "disconnected" | "error" | "registered" | "config_pushed"
    pub event_type: String,
    pub detail: Option<String>,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "node_id", to = "id", on_delete = "Cascade")]
    pub node: HasOne<super::proxy_nodes::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
