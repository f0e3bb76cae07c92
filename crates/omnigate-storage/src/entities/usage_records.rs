use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One row per logical client request. At most one row per request_id;
/// accounting fields freeze once billing_status = "settled".
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "usage_records")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "usage_request_id")]
    pub request_id: String,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub provider_id: Option<i64>,
    pub provider_endpoint_id: Option<i64>,
    pub provider_api_key_id: Option<i64>,
    pub provider: String,
    /// Model as requested by the client, and the upstream name it resolved to.
    pub model: String,
    pub target_model: Option<String>,
    /// Client-side wire signature ("openai:chat"), upstream-side signature,
    /// and whether translation occurred between them.
    pub api_format: Option<String>,
    pub api_family: Option<String>,
    pub endpoint_kind: Option<String>,
    pub endpoint_api_format: Option<String>,
    pub has_format_conversion: bool,
    pub request_type: String,
    pub is_stream: bool,

    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_creation_input_tokens_5m: i64,
    pub cache_creation_input_tokens_1h: i64,
    pub cache_read_input_tokens: i64,

    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub cache_creation_cost_usd: f64,
    pub cache_read_cost_usd: f64,
    pub per_request_cost_usd: f64,
    pub total_cost_usd: f64,
    /// Upstream-side cost when the credential bills differently.
    pub actual_cost_usd: Option<f64>,

    pub status_code: i32,
    /// "pending" | "streaming" | "completed" | "failed" | "cancelled"
    pub status: String,
    /// "pending" | "settled"
    pub billing_status: String,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub first_byte_time_ms: Option<i64>,

    pub request_headers: Option<Json>,
    pub request_body: Option<Json>,
    pub provider_request_headers: Option<Json>,
    pub provider_request_body: Option<Json>,
    pub response_headers: Option<Json>,
    pub response_body: Option<Json>,
    pub client_response_headers: Option<Json>,
    pub client_response_body: Option<Json>,
    /// Retention tier 1 moves JSON bodies here as gzip blobs.
    pub request_body_compressed: Option<Vec<u8>>,
    pub response_body_compressed: Option<Vec<u8>>,

    pub metadata: Option<Json>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
