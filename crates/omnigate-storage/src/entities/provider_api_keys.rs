use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Upstream credential: immutable-ish configuration plus the health state
/// owned by the credential health manager. One wide row on disk; the
/// behavioral split lives in `omnigate-health`.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub endpoint_id: i64,
    pub name: Option<String>,
    /// Encrypted at rest.
    pub secret: Json,
    /// "api_key" | "bearer" | "vertex_ai"
    pub auth_type: String,
    /// Extra auth material (vertex project/location, TLS profile, ...).
    pub auth_config: Option<Json>,
    pub internal_priority: i32,
    pub rate_multiplier: f64,
    pub rate_limit_per_minute: Option<i32>,
    pub max_concurrent: i32,
    pub learned_max_concurrent: i32,
    pub daily_quota_usd: Option<f64>,
    pub daily_used_usd: f64,
    pub monthly_quota_usd: Option<f64>,
    pub monthly_used_usd: f64,
    /// Glob patterns scoping which models this credential serves.
    pub model_include_patterns: Option<Json>,
    pub model_exclude_patterns: Option<Json>,
    /// Browser-grade TLS fingerprint profile name, when impersonation is on.
    pub tls_profile: Option<String>,
    pub enabled: bool,

    // Health state (owned by the health manager).
    pub health_score: f64,
    pub consecutive_failures: i32,
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub total_response_time_ms: i64,
    /// Sampled concurrent-in-flight observations `[{at_ms, in_flight}]`.
    pub utilization_samples: Option<Json>,
    /// Recent outcomes `[{at_ms, ok, tag}]`, capped by count and age.
    pub request_results_window: Option<Json>,
    /// "closed" | "open" | "half_open"
    pub circuit_state: String,
    pub circuit_opened_at: Option<OffsetDateTime>,
    pub next_probe_at: Option<OffsetDateTime>,
    pub half_open_until: Option<OffsetDateTime>,
    pub half_open_successes: i32,
    pub half_open_failures: i32,
    pub probe_interval_seconds: i64,
    pub max_probe_interval_minutes: i64,
    pub cache_ttl_minutes: i64,
    pub last_concurrent_peak: i32,
    pub adjustment_history: Option<Json>,
    pub last_probe_increase_at: Option<OffsetDateTime>,

    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "endpoint_id", to = "id", on_delete = "Cascade")]
    pub endpoint: HasOne<super::provider_endpoints::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
