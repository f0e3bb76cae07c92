use serde::{Deserialize, Serialize};

/// Machine-readable failure category carried by every dispatch error.
///
/// Consumed by the candidate ledger, the credential health manager, and the
/// daily error aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InvalidRequest,
    AuthenticationFailed,
    QuotaExceeded,
    NotFound,
    NoProvidersAvailable,
    UpstreamTimeout,
    UpstreamConnect,
    ProxyError,
    Upstream4xx,
    Upstream429,
    Upstream5xx,
    ParseError,
    Cancelled,
    BillingIncomplete,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::InvalidRequest => "invalid_request",
            ErrorCategory::AuthenticationFailed => "authentication_failed",
            ErrorCategory::QuotaExceeded => "quota_exceeded",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::NoProvidersAvailable => "no_providers_available",
            ErrorCategory::UpstreamTimeout => "upstream_timeout",
            ErrorCategory::UpstreamConnect => "upstream_connect",
            ErrorCategory::ProxyError => "proxy_error",
            ErrorCategory::Upstream4xx => "upstream_4xx",
            ErrorCategory::Upstream429 => "upstream_429",
            ErrorCategory::Upstream5xx => "upstream_5xx",
            ErrorCategory::ParseError => "parse_error",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::BillingIncomplete => "billing_incomplete",
            ErrorCategory::Internal => "internal_error",
        }
    }

    /// Whether the attempt loop may move on to the next candidate.
    pub fn retries_next_candidate(&self) -> bool {
        matches!(
            self,
            ErrorCategory::UpstreamTimeout
                | ErrorCategory::UpstreamConnect
                | ErrorCategory::ProxyError
                | ErrorCategory::Upstream4xx
                | ErrorCategory::Upstream429
                | ErrorCategory::Upstream5xx
        )
    }

    /// Client-facing status when this category surfaces as the final outcome.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCategory::InvalidRequest | ErrorCategory::ParseError => 400,
            ErrorCategory::AuthenticationFailed => 401,
            ErrorCategory::QuotaExceeded => 402,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Upstream429 => 429,
            ErrorCategory::Upstream4xx => 400,
            ErrorCategory::NoProvidersAvailable => 503,
            ErrorCategory::UpstreamTimeout => 504,
            ErrorCategory::UpstreamConnect | ErrorCategory::ProxyError => 502,
            ErrorCategory::Upstream5xx => 502,
            ErrorCategory::Cancelled => 499,
            ErrorCategory::BillingIncomplete => 500,
            ErrorCategory::Internal => 500,
        }
    }
}

/// Classification attached to one credential outcome, driving the health
/// manager's sliding window and circuit-breaker transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureTag {
    RateLimit,
    /// 429 whose shape points at concurrency rather than request rate.
    Concurrent,
    ServerError,
    /// 4xx other than 429: permanent for this credential.
    Permanent,
    /// Auth / key-invalid: opens the breaker immediately.
    AuthInvalid,
    Timeout,
    ConnectError,
}

impl FailureTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureTag::RateLimit => "rate_limit",
            FailureTag::Concurrent => "concurrent",
            FailureTag::ServerError => "server_error",
            FailureTag::Permanent => "permanent",
            FailureTag::AuthInvalid => "auth_invalid",
            FailureTag::Timeout => "timeout",
            FailureTag::ConnectError => "connect_error",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, FailureTag::AuthInvalid)
    }
}
