//! Proxy node surface: register / heartbeat / unregister.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::warn;

use omnigate_nodes::{HeartbeatInput, RegisterInput};

use crate::AppState;

pub async fn register(
    State(state): State<AppState>,
    axum::Json(input): axum::Json<RegisterInput>,
) -> Response {
    match state.nodes.register(input).await {
        Ok(node) => axum::Json(serde_json::json!({
            "node_id": node.id,
            "status": node.status,
            "heartbeat_interval_seconds": node.heartbeat_interval_seconds,
        }))
        .into_response(),
        Err(err) => {
            warn!(error = %err, "node registration failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn heartbeat(
    State(state): State<AppState>,
    axum::Json(input): axum::Json<HeartbeatInput>,
) -> Response {
    match state.nodes.heartbeat(input).await {
        Ok(reply) => axum::Json(reply).into_response(),
        Err(err) => {
            warn!(error = %err, "node heartbeat failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct UnregisterInput {
    pub node_id: i64,
}

pub async fn unregister(
    State(state): State<AppState>,
    axum::Json(input): axum::Json<UnregisterInput>,
) -> Response {
    match state.nodes.unregister(input.node_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            warn!(error = %err, "node unregister failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
