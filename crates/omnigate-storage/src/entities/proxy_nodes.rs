use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Remote proxy worker reachable via a reverse tunnel, or a manual
/// HTTP/SOCKS5 proxy entry.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "proxy_nodes")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "proxy_node_name")]
    pub name: String,
    pub ip: Option<String>,
    /// 0 for tunnel-mode nodes.
    pub port: i32,
    pub region: Option<String>,
    pub hardware: Option<Json>,
    /// "online" | "unhealthy" | "offline"
    pub status: String,
    pub tunnel_mode: bool,
    /// Manual nodes are plain forward proxies; no heartbeats, always online.
    pub manual: bool,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password_masked: Option<String>,
    pub max_concurrent: i32,
    pub learned_max_concurrent: Option<i32>,
    pub heartbeat_interval_seconds: i64,
    pub last_heartbeat_at: Option<OffsetDateTime>,
    pub active_connections: i32,
    pub total_requests: i64,
    pub avg_latency_ms: Option<f64>,
    /// Admin-pushed config applied on the node's next heartbeat.
    pub remote_config: Option<Json>,
    pub config_version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
