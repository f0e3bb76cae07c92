//! Proxy node registry service: register / heartbeat / unregister plus
//! config push, layered over the storage crate and the tunnel manager.

use std::sync::Arc;

use sea_orm::DbErr;
use serde::{Deserialize, Serialize};
use tracing::info;

use omnigate_storage::GatewayStorage;
use omnigate_storage::entities::proxy_nodes;
use omnigate_storage::nodes_store::{NodeMetrics, NodeRegistration};

use crate::tunnel::TunnelManager;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterInput {
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    /// 0 means tunnel mode.
    #[serde(default)]
    pub port: i32,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub hardware: Option<serde_json::Value>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: i32,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: i64,
}

fn default_max_concurrent() -> i32 {
    16
}

fn default_heartbeat_interval() -> i64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatInput {
    pub node_id: i64,
    #[serde(default)]
    pub active_connections: i32,
    #[serde(default)]
    pub total_requests: i64,
    #[serde(default)]
    pub avg_latency_ms: Option<f64>,
    /// Config version the node currently runs.
    #[serde(default)]
    pub config_version: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatReply {
    /// Present when the gateway has newer remote config for the node.
    pub remote_config: Option<serde_json::Value>,
    pub config_version: i64,
}

pub struct NodeRegistry {
    storage: GatewayStorage,
    tunnels: Arc<TunnelManager>,
}

impl NodeRegistry {
    pub fn new(storage: GatewayStorage, tunnels: Arc<TunnelManager>) -> Self {
        Self { storage, tunnels }
    }

    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    /// Upsert a node; it stays `unhealthy` until its tunnel actually opens.
    pub async fn register(&self, input: RegisterInput) -> Result<proxy_nodes::Model, DbErr> {
        let tunnel_mode = input.port == 0;
        let node = self
            .storage
            .register_node(NodeRegistration {
                name: input.name,
                ip: input.ip,
                port: input.port,
                region: input.region,
                hardware: input.hardware,
                tunnel_mode,
                max_concurrent: input.max_concurrent,
                heartbeat_interval_seconds: input.heartbeat_interval_seconds,
            })
            .await?;
        info!(node_id = node.id, node_name = %node.name, "proxy node registered");
        Ok(node)
    }

    /// Record metrics, promote unhealthy → online, and hand back pending
    /// remote config for the node to apply.
    pub async fn heartbeat(&self, input: HeartbeatInput) -> Result<HeartbeatReply, DbErr> {
        let pending = self
            .storage
            .record_heartbeat(
                input.node_id,
                NodeMetrics {
                    active_connections: input.active_connections,
                    total_requests: input.total_requests,
                    avg_latency_ms: input.avg_latency_ms,
                },
            )
            .await?;
        Ok(match pending {
            Some((config, version)) if version > input.config_version => HeartbeatReply {
                remote_config: Some(config),
                config_version: version,
            },
            Some((_, version)) => HeartbeatReply {
                remote_config: None,
                config_version: version,
            },
            None => HeartbeatReply {
                remote_config: None,
                config_version: input.config_version,
            },
        })
    }

    pub async fn unregister(&self, node_id: i64) -> Result<(), DbErr> {
        if self.tunnels.tunnel_closed(node_id) {
            self.storage
                .append_node_event(node_id, "disconnected", Some("unregister".to_string()))
                .await?;
        }
        self.storage.set_node_status(node_id, "offline").await?;
        Ok(())
    }

    pub async fn tunnel_opened(&self, node_id: i64) -> Result<(), DbErr> {
        self.tunnels.tunnel_opened(node_id);
        self.storage.set_node_status(node_id, "online").await?;
        self.storage
            .append_node_event(node_id, "connected", None)
            .await
    }

    pub async fn tunnel_dropped(&self, node_id: i64, reason: &str) -> Result<(), DbErr> {
        self.tunnels.tunnel_closed(node_id);
        self.storage
            .append_node_event(node_id, "disconnected", Some(reason.to_string()))
            .await
    }
}
