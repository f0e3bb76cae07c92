//! Proxy node registry persistence: register/heartbeat upserts, event log,
//! health sweeps, and cascade deletion.

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ActiveValue, EntityTrait, ExprTrait, QueryFilter};
use time::OffsetDateTime;

use crate::GatewayStorage;
use crate::entities::{self, provider_endpoints, providers, proxy_node_events, proxy_nodes};

#[derive(Debug, Clone)]
pub struct NodeRegistration {
    pub name: String,
    pub ip: Option<String>,
    pub port: i32,
    pub region: Option<String>,
    pub hardware: Option<Json>,
    pub tunnel_mode: bool,
    pub max_concurrent: i32,
    pub heartbeat_interval_seconds: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct NodeMetrics {
    pub active_connections: i32,
    pub total_requests: i64,
    pub avg_latency_ms: Option<f64>,
}

impl GatewayStorage {
    /// Upsert by name in tunnel mode, by (ip, port) otherwise. New nodes
    /// start `unhealthy` until the tunnel actually opens.
    pub async fn register_node(
        &self,
        registration: NodeRegistration,
    ) -> Result<proxy_nodes::Model, DbErr> {
        use proxy_nodes::Column;
        let now = OffsetDateTime::now_utc();

        let existing = if registration.tunnel_mode {
            entities::ProxyNodes::find()
                .filter(Column::Name.eq(registration.name.as_str()))
                .one(self.connection())
                .await?
        } else {
            entities::ProxyNodes::find()
                .filter(Column::Ip.eq(registration.ip.clone()))
                .filter(Column::Port.eq(registration.port))
                .one(self.connection())
                .await?
        };

        if let Some(node) = existing {
            entities::ProxyNodes::update_many()
                .col_expr(Column::Name, Expr::value(registration.name.clone()))
                .col_expr(Column::Ip, Expr::value(registration.ip.clone()))
                .col_expr(Column::Port, Expr::value(registration.port))
                .col_expr(Column::Region, Expr::value(registration.region.clone()))
                .col_expr(Column::Hardware, Expr::value(registration.hardware.clone()))
                .col_expr(Column::TunnelMode, Expr::value(registration.tunnel_mode))
                .col_expr(
                    Column::MaxConcurrent,
                    Expr::value(registration.max_concurrent),
                )
                .col_expr(
                    Column::HeartbeatIntervalSeconds,
                    Expr::value(registration.heartbeat_interval_seconds),
                )
                .col_expr(Column::Status, Expr::value("unhealthy"))
                .col_expr(Column::UpdatedAt, Expr::value(now))
                .filter(Column::Id.eq(node.id))
                .exec(self.connection())
                .await?;
            self.append_node_event(node.id, "registered", None).await?;
            return Ok(entities::ProxyNodes::find_by_id(node.id)
                .one(self.connection())
                .await?
                .unwrap_or(node));
        }

        let active = proxy_nodes::ActiveModel {
            id: ActiveValue::NotSet,
            name: ActiveValue::Set(registration.name),
            ip: ActiveValue::Set(registration.ip),
            port: ActiveValue::Set(registration.port),
            region: ActiveValue::Set(registration.region),
            hardware: ActiveValue::Set(registration.hardware),
            status: ActiveValue::Set("unhealthy".to_string()),
            tunnel_mode: ActiveValue::Set(registration.tunnel_mode),
            manual: ActiveValue::Set(false),
            url: ActiveValue::Set(None),
            username: ActiveValue::Set(None),
            password_masked: ActiveValue::Set(None),
            max_concurrent: ActiveValue::Set(registration.max_concurrent),
            learned_max_concurrent: ActiveValue::Set(None),
            heartbeat_interval_seconds: ActiveValue::Set(registration.heartbeat_interval_seconds),
            last_heartbeat_at: ActiveValue::Set(None),
            active_connections: ActiveValue::Set(0),
            total_requests: ActiveValue::Set(0),
            avg_latency_ms: ActiveValue::Set(None),
            remote_config: ActiveValue::Set(None),
            config_version: ActiveValue::Set(0),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        let result = entities::ProxyNodes::insert(active)
            .on_conflict(
                OnConflict::column(proxy_nodes::Column::Name)
                    .update_columns([Column::Ip, Column::Port, Column::UpdatedAt])
                    .to_owned(),
            )
            .exec_with_returning(self.connection())
            .await?;
        self.append_node_event(result.id, "registered", None).await?;
        Ok(result)
    }

    /// Heartbeat: update metrics, promote `unhealthy → online`. Returns the
    /// pending remote config (with version) so the node can apply it.
    pub async fn record_heartbeat(
        &self,
        node_id: i64,
        metrics: NodeMetrics,
    ) -> Result<Option<(Json, i64)>, DbErr> {
        use proxy_nodes::Column;
        let now = OffsetDateTime::now_utc();
        entities::ProxyNodes::update_many()
            .col_expr(Column::LastHeartbeatAt, Expr::value(now))
            .col_expr(
                Column::ActiveConnections,
                Expr::value(metrics.active_connections),
            )
            .col_expr(Column::TotalRequests, Expr::value(metrics.total_requests))
            .col_expr(Column::AvgLatencyMs, Expr::value(metrics.avg_latency_ms))
            .col_expr(Column::Status, Expr::value("online"))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(node_id))
            .filter(Column::Status.is_in(["online", "unhealthy", "offline"]))
            .exec(self.connection())
            .await?;

        let node = entities::ProxyNodes::find_by_id(node_id)
            .one(self.connection())
            .await?;
        Ok(node.and_then(|node| {
            node.remote_config
                .map(|config| (config, node.config_version))
        }))
    }

    pub async fn push_node_config(&self, node_id: i64, config: Json) -> Result<i64, DbErr> {
        use proxy_nodes::Column;
        entities::ProxyNodes::update_many()
            .col_expr(Column::RemoteConfig, Expr::value(config))
            .col_expr(
                Column::ConfigVersion,
                Expr::col(Column::ConfigVersion).add(1),
            )
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(node_id))
            .exec(self.connection())
            .await?;
        let version = entities::ProxyNodes::find_by_id(node_id)
            .one(self.connection())
            .await?
            .map(|node| node.config_version)
            .unwrap_or(0);
        self.append_node_event(node_id, "config_pushed", None).await?;
        Ok(version)
    }

    pub async fn set_node_status(&self, node_id: i64, status: &str) -> Result<(), DbErr> {
        use proxy_nodes::Column;
        entities::ProxyNodes::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(node_id))
            .exec(self.connection())
            .await?;
        Ok(())
    }

    pub async fn list_nodes(&self) -> Result<Vec<proxy_nodes::Model>, DbErr> {
        entities::ProxyNodes::find().all(self.connection()).await
    }

    pub async fn append_node_event(
        &self,
        node_id: i64,
        event_type: &str,
        detail: Option<String>,
    ) -> Result<(), DbErr> {
        let active = proxy_node_events::ActiveModel {
            id: ActiveValue::NotSet,
            node_id: ActiveValue::Set(node_id),
            event_type: ActiveValue::Set(event_type.to_string()),
            detail: ActiveValue::Set(detail),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        entities::ProxyNodeEvents::insert(active)
            .exec(self.connection())
            .await?;
        Ok(())
    }

    pub async fn trim_node_events(&self, older_than_days: i64) -> Result<u64, DbErr> {
        use proxy_node_events::Column;
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(older_than_days);
        let result = entities::ProxyNodeEvents::delete_many()
            .filter(Column::CreatedAt.lt(cutoff))
            .exec(self.connection())
            .await?;
        Ok(result.rows_affected)
    }

    /// Delete a node and clear every reference to it: provider/endpoint
    /// `proxy` JSON columns that point at the node.
    pub async fn delete_node(&self, node_id: i64) -> Result<(), DbErr> {
        let node_ref = serde_json::json!({ "node_id": node_id });
        entities::Providers::update_many()
            .col_expr(providers::Column::Proxy, Expr::value(Option::<Json>::None))
            .filter(providers::Column::Proxy.eq(node_ref.clone()))
            .exec(self.connection())
            .await?;
        entities::ProviderEndpoints::update_many()
            .col_expr(
                provider_endpoints::Column::Proxy,
                Expr::value(Option::<Json>::None),
            )
            .filter(provider_endpoints::Column::Proxy.eq(node_ref))
            .exec(self.connection())
            .await?;
        entities::ProxyNodes::delete_by_id(node_id)
            .exec(self.connection())
            .await?;
        Ok(())
    }
}
