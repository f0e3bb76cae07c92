mod nodes;
mod proxy;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use omnigate_dispatch::{Dispatcher, KeyLimiter};
use omnigate_nodes::NodeRegistry;
use omnigate_storage::GatewayStorage;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub storage: GatewayStorage,
    pub nodes: Arc<NodeRegistry>,
    pub key_limiter: Arc<KeyLimiter>,
}

pub fn gateway_router(state: AppState) -> Router {
    Router::new()
        // openai family
        .route("/v1/chat/completions", post(proxy::openai_chat))
        .route("/v1/responses", post(proxy::openai_responses))
        .route("/v1/videos", post(proxy::openai_video_create))
        .route("/v1/videos/{id}", get(proxy::openai_video_get))
        .route("/v1/images/generations", post(proxy::openai_images))
        .route("/v1/embeddings", post(proxy::openai_embeddings))
        .route("/v1/audio/speech", post(proxy::openai_audio))
        .route("/v1/models", get(proxy::openai_models))
        // claude family
        .route("/v1/messages", post(proxy::claude_messages))
        // gemini family: the action rides after a colon in the last segment
        .route("/v1beta/models/{model_action}", post(proxy::gemini_generate))
        // proxy node surface
        .route("/api/admin/proxy-nodes/register", post(nodes::register))
        .route("/api/admin/proxy-nodes/heartbeat", post(nodes::heartbeat))
        .route("/api/admin/proxy-nodes/unregister", post(nodes::unregister))
        .with_state(state)
}
