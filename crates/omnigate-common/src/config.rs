use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required gateway config field: {0}")]
    MissingField(&'static str),
}

/// Retention tiers for usage row bodies/headers, in days.
///
/// Stage order: compress bodies, delete compressed blobs, clear headers,
/// delete the row. A stage set to 0 disables it and every later stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub compress_bodies_after_days: u32,
    pub delete_bodies_after_days: u32,
    pub clear_headers_after_days: u32,
    pub delete_rows_after_days: u32,
    pub batch_size: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            compress_bodies_after_days: 7,
            delete_bodies_after_days: 30,
            clear_headers_after_days: 60,
            delete_rows_after_days: 180,
            batch_size: 500,
        }
    }
}

/// Durable usage stream knobs (Redis streams).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageQueueConfig {
    pub stream_key: String,
    pub group: String,
    pub dlq_key: String,
    pub consumer_batch: usize,
    pub block_ms: u64,
    pub claim_idle_ms: u64,
    pub claim_interval_secs: u64,
    pub max_retries: u32,
    pub stream_maxlen: usize,
    pub dlq_maxlen: usize,
}

impl Default for UsageQueueConfig {
    fn default() -> Self {
        Self {
            stream_key: "omnigate:usage:stream".to_string(),
            group: "omnigate-usage".to_string(),
            dlq_key: "omnigate:usage:dlq".to_string(),
            consumer_batch: 128,
            block_ms: 2_000,
            claim_idle_ms: 60_000,
            claim_interval_secs: 30,
            max_retries: 5,
            stream_maxlen: 100_000,
            dlq_maxlen: 10_000,
        }
    }
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext).
    pub admin_key_hash: String,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Optional Redis URL; absent means direct telemetry writes and
    /// run-anyway advisory locks.
    pub redis_url: Option<String>,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// IANA timezone name used by cron schedules.
    pub timezone: String,
    /// Reject settlement instead of recording zero cost when a required
    /// billing dimension is missing.
    pub strict_billing: bool,
    pub retention: RetentionConfig,
    pub usage_queue: UsageQueueConfig,
    /// Max body sizes accepted into telemetry events (0 = unlimited).
    pub max_request_body_bytes: usize,
    pub max_response_body_bytes: usize,
}

/// Optional layer used for merging gateway config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub dsn: Option<String>,
    pub redis_url: Option<String>,
    pub proxy: Option<String>,
    pub timezone: Option<String>,
    pub strict_billing: Option<bool>,
    pub retention: Option<RetentionConfig>,
    pub usage_queue: Option<UsageQueueConfig>,
    pub max_request_body_bytes: Option<usize>,
    pub max_response_body_bytes: Option<usize>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.redis_url.is_some() {
            self.redis_url = other.redis_url;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.timezone.is_some() {
            self.timezone = other.timezone;
        }
        if other.strict_billing.is_some() {
            self.strict_billing = other.strict_billing;
        }
        if other.retention.is_some() {
            self.retention = other.retention;
        }
        if other.usage_queue.is_some() {
            self.usage_queue = other.usage_queue;
        }
        if other.max_request_body_bytes.is_some() {
            self.max_request_body_bytes = other.max_request_body_bytes;
        }
        if other.max_response_body_bytes.is_some() {
            self.max_response_body_bytes = other.max_response_body_bytes;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8788),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GatewayConfigError::MissingField("admin_key_hash"))?,
            dsn: self.dsn.ok_or(GatewayConfigError::MissingField("dsn"))?,
            redis_url: self.redis_url,
            proxy: self.proxy,
            timezone: self.timezone.unwrap_or_else(|| "UTC".to_string()),
            strict_billing: self.strict_billing.unwrap_or(false),
            retention: self.retention.unwrap_or_default(),
            usage_queue: self.usage_queue.unwrap_or_default(),
            max_request_body_bytes: self.max_request_body_bytes.unwrap_or(262_144),
            max_response_body_bytes: self.max_response_body_bytes.unwrap_or(262_144),
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            dsn: Some(value.dsn),
            redis_url: value.redis_url,
            proxy: value.proxy,
            timezone: Some(value.timezone),
            strict_billing: Some(value.strict_billing),
            retention: Some(value.retention),
            usage_queue: Some(value.usage_queue),
            max_request_body_bytes: Some(value.max_request_body_bytes),
            max_response_body_bytes: Some(value.max_response_body_bytes),
        }
    }
}
