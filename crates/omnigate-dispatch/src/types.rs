use omnigate_common::EndpointSignature;
use omnigate_storage::entities::{api_keys, users};
use serde_json::Value;

/// Capabilities the request shape (or per-user/per-key overrides) demands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequiredCapabilities {
    pub vision: bool,
    pub function_calling: bool,
    pub extended_thinking: bool,
}

/// One authenticated, normalized client request ready for planning.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub request_id: String,
    pub api_key: api_keys::Model,
    pub user: Option<users::Model>,
    /// Client-side wire signature.
    pub client_signature: EndpointSignature,
    /// Model name exactly as the client sent it.
    pub requested_model: String,
    /// Canonical GlobalModel name after ModelMapping resolution.
    pub normalized_model: String,
    pub capabilities: RequiredCapabilities,
    pub body: Value,
    pub is_stream: bool,
    /// blake3(api_key_id) — sticky dispersion between equivalent credentials.
    pub affinity_key: u64,
    pub metadata: Option<Value>,
}

impl ResolvedRequest {
    pub fn affinity_for_key(api_key_id: i64) -> u64 {
        let digest = blake3::hash(&api_key_id.to_le_bytes());
        u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("digest length"))
    }
}
