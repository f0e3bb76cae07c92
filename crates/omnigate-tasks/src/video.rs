//! Pure decision logic for the video poller: status interpretation,
//! permanent-vs-transient classification, and backoff.

use serde_json::Value;

/// Primary predicate: status code decides. 4xx except 429 is permanent.
/// The substring matcher is a fallback for transports that surface no code.
pub fn is_permanent_poll_error(status_code: Option<u16>, message: &str) -> bool {
    if let Some(code) = status_code {
        return (400..500).contains(&code) && code != 429;
    }
    let lowered = message.to_ascii_lowercase();
    ["not found", "invalid", "expired", "unauthorized"]
        .iter()
        .any(|needle| lowered.contains(needle))
}

/// Exponential backoff for transient poll failures:
/// `min(interval × 2^min(retry, 5), 300s)`.
pub fn backoff_delay(poll_interval_seconds: i64, retry_count: i32) -> i64 {
    let exponent = retry_count.clamp(0, 5) as u32;
    (poll_interval_seconds.max(1) * 2_i64.pow(exponent)).min(300)
}

/// What one upstream poll response means for the job.
#[derive(Debug, Clone, PartialEq)]
pub enum PollDecision {
    /// Still running: reschedule at the normal cadence.
    StillRunning { progress: Option<f64> },
    Completed {
        urls: Vec<String>,
        expires_at_unix: Option<i64>,
    },
    Failed {
        error_code: String,
        error_message: String,
    },
    /// Transient transport/HTTP error: back off and retry.
    Transient { error_message: String },
}

/// Interpret the upstream video-job body (openai video schema).
pub fn decide(status_code: u16, body: &Value) -> PollDecision {
    if status_code == 429 || status_code >= 500 {
        return PollDecision::Transient {
            error_message: format!("upstream returned {status_code}"),
        };
    }
    if (400..500).contains(&status_code) {
        return PollDecision::Failed {
            error_code: format!("upstream_{status_code}"),
            error_message: body
                .get("error")
                .map(|error| error.to_string())
                .unwrap_or_else(|| format!("poll rejected with {status_code}")),
        };
    }

    let status = body
        .get("status")
        .and_then(|status| status.as_str())
        .unwrap_or_default();
    match status {
        "completed" | "succeeded" => {
            let mut urls = Vec::new();
            if let Some(url) = body.get("url").and_then(|url| url.as_str()) {
                urls.push(url.to_string());
            }
            if let Some(outputs) = body.get("outputs").and_then(|outputs| outputs.as_array()) {
                urls.extend(
                    outputs
                        .iter()
                        .filter_map(|output| output.get("url"))
                        .filter_map(|url| url.as_str())
                        .map(str::to_string),
                );
            }
            PollDecision::Completed {
                urls,
                expires_at_unix: body.get("expires_at").and_then(|value| value.as_i64()),
            }
        }
        "failed" | "cancelled" | "error" => PollDecision::Failed {
            error_code: status.to_string(),
            error_message: body
                .get("error")
                .map(|error| error.to_string())
                .unwrap_or_else(|| "upstream job failed".to_string()),
        },
        _ => PollDecision::StillRunning {
            progress: body.get("progress").and_then(|value| value.as_f64()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_code_is_the_primary_predicate() {
        assert!(is_permanent_poll_error(Some(404), "anything"));
        assert!(!is_permanent_poll_error(Some(429), "rate limited"));
        assert!(!is_permanent_poll_error(Some(503), "oops"));
    }

    #[test]
    fn substring_matcher_is_fallback_only() {
        assert!(is_permanent_poll_error(None, "task not found"));
        assert!(!is_permanent_poll_error(None, "connection reset"));
        // With a code present the message is ignored.
        assert!(!is_permanent_poll_error(Some(500), "not found"));
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(10, 0), 10);
        assert_eq!(backoff_delay(10, 1), 20);
        assert_eq!(backoff_delay(10, 5), 300); // 320 capped
        assert_eq!(backoff_delay(10, 9), 300); // exponent clamped at 5
    }

    #[test]
    fn running_body_reschedules() {
        let decision = decide(200, &json!({"status": "processing", "progress": 0.4}));
        assert_eq!(decision, PollDecision::StillRunning { progress: Some(0.4) });
    }

    #[test]
    fn completed_body_collects_urls() {
        let decision = decide(
            200,
            &json!({
                "status": "completed",
                "url": "https://cdn.example/video.mp4",
                "expires_at": 1_800_000_000
            }),
        );
        match decision {
            PollDecision::Completed { urls, expires_at_unix } => {
                assert_eq!(urls, vec!["https://cdn.example/video.mp4".to_string()]);
                assert_eq!(expires_at_unix, Some(1_800_000_000));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn http_4xx_fails_permanently_and_5xx_is_transient() {
        assert!(matches!(decide(404, &json!({})), PollDecision::Failed { .. }));
        assert!(matches!(decide(502, &json!({})), PollDecision::Transient { .. }));
        assert!(matches!(decide(429, &json!({})), PollDecision::Transient { .. }));
    }
}
