//! Upstream URL/header construction and error classification.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use omnigate_common::{ApiFamily, EndpointKind, EndpointSignature, ErrorCategory, FailureTag};
use omnigate_storage::entities::{provider_api_keys, provider_endpoints};

use crate::error::DispatchError;

/// Query parameters that must never reach logs in the clear.
const SENSITIVE_QUERY_KEYS: [&str; 6] =
    ["key", "api_key", "apikey", "token", "secret", "credential"];

pub fn redact_url_for_log(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let redacted: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _))
                if SENSITIVE_QUERY_KEYS
                    .iter()
                    .any(|sensitive| key.eq_ignore_ascii_case(sensitive)) =>
            {
                format!("{key}=***")
            }
            _ => pair.to_string(),
        })
        .collect();
    format!("{base}?{}", redacted.join("&"))
}

/// Default path for one endpoint signature.
pub fn default_path(
    signature: EndpointSignature,
    model: &str,
    is_stream: bool,
    provider_type: Option<&str>,
) -> String {
    match (signature.family, signature.kind) {
        (ApiFamily::OpenAI, EndpointKind::Chat) => "/v1/chat/completions".to_string(),
        (ApiFamily::OpenAI, EndpointKind::Cli) => {
            // Codex serves the Responses schema at /responses without /v1.
            if provider_type == Some("codex") {
                "/responses".to_string()
            } else {
                "/v1/responses".to_string()
            }
        }
        (ApiFamily::OpenAI, EndpointKind::Video) => "/v1/videos".to_string(),
        (ApiFamily::OpenAI, EndpointKind::Images) => "/v1/images/generations".to_string(),
        (ApiFamily::OpenAI, EndpointKind::Embeddings) => "/v1/embeddings".to_string(),
        (ApiFamily::OpenAI, EndpointKind::Audio) => "/v1/audio/speech".to_string(),
        (ApiFamily::OpenAI, EndpointKind::Models) => "/v1/models".to_string(),
        (ApiFamily::Claude, _) => "/v1/messages".to_string(),
        (ApiFamily::Gemini, EndpointKind::Cli) => {
            if is_stream {
                "/v1internal:streamGenerateContent?alt=sse".to_string()
            } else {
                "/v1internal:generateContent".to_string()
            }
        }
        (ApiFamily::Gemini, _) => {
            if is_stream {
                format!("/v1beta/models/{model}:streamGenerateContent?alt=sse")
            } else {
                format!("/v1beta/models/{model}:generateContent")
            }
        }
    }
}

/// Strip a version suffix from the base when the path restates it, so
/// `base=/v1` + `path=/v1/messages` never yields `/v1/v1/messages`.
fn normalize_base(base_url: &str, path: &str) -> String {
    let mut base = base_url.trim_end_matches('/').to_string();
    for suffix in ["/v1beta", "/v1internal", "/v1", "/v2", "/v3"] {
        if base.ends_with(suffix) && path.starts_with(suffix) {
            base.truncate(base.len() - suffix.len());
            break;
        }
    }
    base
}

fn apply_path_params(template: &str, model: &str) -> String {
    template.replace("{model}", model)
}

/// URL precedence: vertex synthesis → endpoint custom path → family default.
pub fn build_upstream_url(
    endpoint: &provider_endpoints::Model,
    credential: &provider_api_keys::Model,
    signature: EndpointSignature,
    provider_type: Option<&str>,
    model: &str,
    is_stream: bool,
    base_override: Option<&str>,
) -> Result<String, DispatchError> {
    if credential.auth_type == "vertex_ai" {
        let config = credential.auth_config.as_ref().ok_or_else(|| {
            DispatchError::new(ErrorCategory::Internal, "vertex credential missing auth_config")
        })?;
        let project = config.get("project_id").and_then(|v| v.as_str()).ok_or_else(|| {
            DispatchError::new(ErrorCategory::Internal, "vertex credential missing project_id")
        })?;
        let location = config
            .get("location")
            .and_then(|v| v.as_str())
            .unwrap_or("us-central1");
        let method = if is_stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        return Ok(format!(
            "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models/{model}:{method}"
        ));
    }

    let base_url = base_override.unwrap_or(endpoint.base_url.as_str());
    let path = match endpoint.custom_path.as_deref() {
        Some(template) if !template.is_empty() => apply_path_params(template, model),
        _ => default_path(signature, model, is_stream, provider_type),
    };
    Ok(format!("{}{}", normalize_base(base_url, &path), path))
}

fn secret_value(credential: &provider_api_keys::Model) -> String {
    credential
        .secret
        .get("api_key")
        .or_else(|| credential.secret.get("token"))
        .and_then(|value| value.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Family- and auth-type-specific headers, merged with endpoint extras.
pub fn build_headers(
    endpoint: &provider_endpoints::Model,
    credential: &provider_api_keys::Model,
    signature: EndpointSignature,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = vec![(
        "content-type".to_string(),
        "application/json".to_string(),
    )];
    let secret = secret_value(credential);
    match credential.auth_type.as_str() {
        "bearer" | "vertex_ai" => {
            headers.push(("authorization".to_string(), format!("Bearer {secret}")));
        }
        _ => match signature.family {
            ApiFamily::OpenAI => {
                headers.push(("authorization".to_string(), format!("Bearer {secret}")));
            }
            ApiFamily::Claude => {
                headers.push(("x-api-key".to_string(), secret));
                headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
            }
            ApiFamily::Gemini => {
                headers.push(("x-goog-api-key".to_string(), secret));
            }
        },
    }
    if let Some(extra) = endpoint
        .custom_headers
        .as_ref()
        .and_then(|value| value.as_object())
    {
        for (key, value) in extra {
            if let Some(text) = value.as_str() {
                headers.push((key.to_ascii_lowercase(), text.to_string()));
            }
        }
    }
    headers
}

/// Classify a transport-level failure.
pub fn classify_transport_error(err: &wreq::Error) -> (ErrorCategory, FailureTag) {
    if err.is_timeout() {
        (ErrorCategory::UpstreamTimeout, FailureTag::Timeout)
    } else if err.is_connect() {
        (ErrorCategory::UpstreamConnect, FailureTag::ConnectError)
    } else {
        (ErrorCategory::ProxyError, FailureTag::ConnectError)
    }
}

/// Classify a non-success upstream status. The body is consulted to split
/// 429s into rate-vs-concurrency and to spot hard input errors.
pub fn classify_status(status: StatusCode, body: &Bytes) -> (ErrorCategory, FailureTag) {
    match status.as_u16() {
        401 | 403 => (ErrorCategory::Upstream4xx, FailureTag::AuthInvalid),
        429 => {
            let tag = if body_mentions(body, &["concurren", "parallel", "simultaneous"]) {
                FailureTag::Concurrent
            } else {
                FailureTag::RateLimit
            };
            (ErrorCategory::Upstream429, tag)
        }
        400..=499 => (ErrorCategory::Upstream4xx, FailureTag::Permanent),
        _ => (ErrorCategory::Upstream5xx, FailureTag::ServerError),
    }
}

/// A 4xx body declaring a hard input error stops the attempt loop: every
/// other candidate would reject the same body.
pub fn is_hard_input_error(status: StatusCode, body: &Bytes) -> bool {
    status.as_u16() == 400
        && body_mentions(
            body,
            &["invalid request body", "invalid_request_error", "malformed json"],
        )
}

fn body_mentions(body: &Bytes, needles: &[&str]) -> bool {
    let Ok(text) = std::str::from_utf8(body) else {
        return false;
    };
    let lowered = text.to_ascii_lowercase();
    needles.iter().any(|needle| lowered.contains(needle))
}

pub fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(http::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let value = value.trim();
            if let Ok(seconds) = value.parse::<u64>() {
                return Some(seconds);
            }
            if let Ok(when) = httpdate::parse_http_date(value) {
                return when
                    .duration_since(std::time::SystemTime::now())
                    .ok()
                    .map(|duration| duration.as_secs());
            }
            None
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn endpoint(base_url: &str, custom_path: Option<&str>) -> provider_endpoints::Model {
        provider_endpoints::Model {
            id: 1,
            provider_id: 1,
            api_family: "openai".to_string(),
            endpoint_kind: "chat".to_string(),
            base_url: base_url.to_string(),
            custom_path: custom_path.map(Into::into),
            custom_headers: None,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            first_byte_timeout_ms: None,
            proxy: None,
            enabled: true,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn credential(auth_type: &str, auth_config: Option<serde_json::Value>) -> provider_api_keys::Model {
        provider_api_keys::Model {
            id: 1,
            endpoint_id: 1,
            name: None,
            secret: serde_json::json!({"api_key": "sk-secret"}),
            auth_type: auth_type.to_string(),
            auth_config,
            internal_priority: 0,
            rate_multiplier: 1.0,
            rate_limit_per_minute: None,
            max_concurrent: 5,
            learned_max_concurrent: 5,
            daily_quota_usd: None,
            daily_used_usd: 0.0,
            monthly_quota_usd: None,
            monthly_used_usd: 0.0,
            model_include_patterns: None,
            model_exclude_patterns: None,
            tls_profile: None,
            enabled: true,
            health_score: 1.0,
            consecutive_failures: 0,
            request_count: 0,
            success_count: 0,
            error_count: 0,
            total_response_time_ms: 0,
            utilization_samples: None,
            request_results_window: None,
            circuit_state: "closed".to_string(),
            circuit_opened_at: None,
            next_probe_at: None,
            half_open_until: None,
            half_open_successes: 0,
            half_open_failures: 0,
            probe_interval_seconds: 30,
            max_probe_interval_minutes: 30,
            cache_ttl_minutes: 5,
            last_concurrent_peak: 0,
            adjustment_history: None,
            last_probe_increase_at: None,
            created_at: OffsetDateTime::now_utc(),
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    fn sig(family: ApiFamily, kind: EndpointKind) -> EndpointSignature {
        EndpointSignature::new(family, kind)
    }

    #[test]
    fn version_prefix_never_doubles() {
        let url = build_upstream_url(
            &endpoint("https://api.example.com/v1", None),
            &credential("api_key", None),
            sig(ApiFamily::OpenAI, EndpointKind::Chat),
            None,
            "gpt-4o",
            false,
            None,
        )
        .unwrap();
        assert_eq!(url, "https://api.example.com/v1/chat/completions");
    }

    #[test]
    fn custom_path_substitutes_model() {
        let url = build_upstream_url(
            &endpoint("https://api.example.com", Some("/custom/{model}/run")),
            &credential("api_key", None),
            sig(ApiFamily::OpenAI, EndpointKind::Chat),
            None,
            "gpt-4o",
            false,
            None,
        )
        .unwrap();
        assert_eq!(url, "https://api.example.com/custom/gpt-4o/run");
    }

    #[test]
    fn gemini_stream_url_carries_model_and_alt_sse() {
        let url = build_upstream_url(
            &endpoint("https://generativelanguage.googleapis.com", None),
            &credential("api_key", None),
            sig(ApiFamily::Gemini, EndpointKind::Chat),
            None,
            "gemini-2.0-flash",
            true,
            None,
        )
        .unwrap();
        assert!(url.ends_with("/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"));
    }

    #[test]
    fn codex_uses_responses_without_v1() {
        let url = build_upstream_url(
            &endpoint("https://chatgpt.com/backend-api/codex", None),
            &credential("bearer", None),
            sig(ApiFamily::OpenAI, EndpointKind::Cli),
            Some("codex"),
            "gpt-5",
            true,
            None,
        )
        .unwrap();
        assert_eq!(url, "https://chatgpt.com/backend-api/codex/responses");
    }

    #[test]
    fn vertex_url_is_synthesized() {
        let url = build_upstream_url(
            &endpoint("https://ignored.example.com", None),
            &credential(
                "vertex_ai",
                Some(serde_json::json!({"project_id": "proj", "location": "europe-west4"})),
            ),
            sig(ApiFamily::Gemini, EndpointKind::Chat),
            None,
            "gemini-2.0-flash",
            false,
            None,
        )
        .unwrap();
        assert_eq!(
            url,
            "https://europe-west4-aiplatform.googleapis.com/v1/projects/proj/locations/europe-west4/publishers/google/models/gemini-2.0-flash:generateContent"
        );
    }

    #[test]
    fn family_auth_headers() {
        let claude_headers = build_headers(
            &endpoint("https://api.anthropic.com", None),
            &credential("api_key", None),
            sig(ApiFamily::Claude, EndpointKind::Chat),
        );
        assert!(claude_headers.iter().any(|(k, v)| k == "x-api-key" && v == "sk-secret"));
        assert!(claude_headers.iter().any(|(k, _)| k == "anthropic-version"));

        let gemini_headers = build_headers(
            &endpoint("https://generativelanguage.googleapis.com", None),
            &credential("api_key", None),
            sig(ApiFamily::Gemini, EndpointKind::Chat),
        );
        assert!(gemini_headers.iter().any(|(k, _)| k == "x-goog-api-key"));
    }

    #[test]
    fn sensitive_query_params_are_redacted() {
        let url = "https://host/path?key=secret&alt=sse&token=abc";
        assert_eq!(redact_url_for_log(url), "https://host/path?key=***&alt=sse&token=***");
    }

    #[test]
    fn status_classification() {
        let empty = Bytes::new();
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED, &empty),
            (ErrorCategory::Upstream4xx, FailureTag::AuthInvalid)
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &Bytes::from("too many concurrent requests")),
            (ErrorCategory::Upstream429, FailureTag::Concurrent)
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &Bytes::from("rate limit exceeded")),
            (ErrorCategory::Upstream429, FailureTag::RateLimit)
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, &empty),
            (ErrorCategory::Upstream5xx, FailureTag::ServerError)
        );
    }

    #[test]
    fn hard_input_errors_stop_the_loop() {
        assert!(is_hard_input_error(
            StatusCode::BAD_REQUEST,
            &Bytes::from("{\"error\": \"invalid request body\"}")
        ));
        assert!(!is_hard_input_error(
            StatusCode::BAD_REQUEST,
            &Bytes::from("{\"error\": \"model overloaded\"}")
        ));
    }
}
