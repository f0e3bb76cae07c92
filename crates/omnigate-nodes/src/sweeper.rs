//! Periodic node health sweep.
//!
//! A non-manual node is `unhealthy` when this worker holds no tunnel for it
//! (only meaningful for locally-terminated tunnels) and `offline` when its
//! heartbeat is stale — staleness alone decides offline, so a tunnel
//! terminating in another worker never causes a false negative.

use std::sync::Arc;

use sea_orm::DbErr;
use time::OffsetDateTime;
use tracing::info;

use omnigate_storage::GatewayStorage;

use crate::tunnel::TunnelManager;

const MIN_STALE_SECONDS: i64 = 90;

fn stale_threshold_seconds(heartbeat_interval_seconds: i64) -> i64 {
    (heartbeat_interval_seconds * 3).max(MIN_STALE_SECONDS)
}

pub async fn sweep_once(
    storage: &GatewayStorage,
    tunnels: &Arc<TunnelManager>,
    event_retention_days: i64,
) -> Result<(), DbErr> {
    let now = OffsetDateTime::now_utc();
    for node in storage.list_nodes().await? {
        if node.manual {
            // Manual forward proxies carry no heartbeats and stay online.
            if node.status != "online" {
                storage.set_node_status(node.id, "online").await?;
            }
            continue;
        }

        let stale_after = time::Duration::seconds(stale_threshold_seconds(
            node.heartbeat_interval_seconds,
        ));
        let heartbeat_stale = node
            .last_heartbeat_at
            .map(|at| now - at > stale_after)
            .unwrap_or(true);

        let next_status = if heartbeat_stale {
            // Offline is decided solely by heartbeat staleness.
            "offline"
        } else if node.tunnel_mode && !tunnels.has_tunnel(node.id) {
            // Local tunnel view is advisory: degrade, never offline.
            "unhealthy"
        } else {
            "online"
        };

        if next_status != node.status {
            info!(
                node_id = node.id,
                node_name = %node.name,
                from = %node.status,
                to = next_status,
                "proxy node status change"
            );
            storage.set_node_status(node.id, next_status).await?;
            if next_status == "offline" {
                storage
                    .append_node_event(node.id, "error", Some("heartbeat stale".to_string()))
                    .await?;
            }
        }
    }

    storage.trim_node_events(event_retention_days).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_threshold_has_a_floor() {
        assert_eq!(stale_threshold_seconds(10), 90);
        assert_eq!(stale_threshold_seconds(60), 180);
    }
}
