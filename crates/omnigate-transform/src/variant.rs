//! Provider variant hooks.
//!
//! A hook wraps/unwraps request and response envelopes, contributes headers,
//! rewrites the URL, and may force stream rewriting even when the client and
//! upstream signatures match. Provider quirks live here instead of leaking
//! into the generic converters.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;

/// One provider's shim around the generic conversion path.
pub trait VariantHook: Send + Sync {
    /// Wrap the outgoing request body.
    fn wrap_request(&self, body: Value, model: &str) -> Value {
        let _ = model;
        body
    }

    /// Headers to merge into the upstream request.
    fn extra_headers(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Unwrap a non-stream response body (and each parsed stream event).
    fn unwrap_response(&self, body: Value) -> Value {
        body
    }

    /// Replace the base URL for this attempt, if the hook manages a pool.
    fn select_base_url(&self) -> Option<String> {
        None
    }

    /// Observe the HTTP status for the URL used (pool demotion).
    fn on_http_status(&self, base_url: &str, status: u16) {
        let _ = (base_url, status);
    }

    fn on_connection_error(&self, base_url: &str) {
        let _ = base_url;
    }

    /// Whether SSE bytes must be parsed and rewritten even when the
    /// signatures match (the envelope wraps each event).
    fn force_stream_rewrite(&self) -> bool {
        false
    }
}

/// Prioritised base-URL pool with demote-on-failure and TTL recovery.
///
/// The most recent successful URL is promoted; a URL marked unavailable is
/// skipped until its TTL elapses. With every URL marked out, the base order
/// still applies so traffic keeps flowing while the TTL recovers them.
pub struct UrlPool {
    base_order: Vec<String>,
    unavailable_ttl: Duration,
    inner: Mutex<UrlPoolInner>,
}

#[derive(Default)]
struct UrlPoolInner {
    unavailable_until: HashMap<String, Instant>,
    last_success: Option<String>,
}

impl UrlPool {
    pub fn new(base_order: Vec<String>, unavailable_ttl: Duration) -> Self {
        Self {
            base_order,
            unavailable_ttl,
            inner: Mutex::new(UrlPoolInner::default()),
        }
    }

    pub fn ordered(&self) -> Vec<String> {
        let mut inner = self.inner.lock().expect("url pool lock poisoned");
        let now = Instant::now();
        inner.unavailable_until.retain(|_, until| *until > now);

        let mut order = self.base_order.clone();
        if let Some(last_success) = &inner.last_success
            && let Some(position) = order.iter().position(|url| url == last_success)
        {
            let url = order.remove(position);
            order.insert(0, url);
        }
        let available: Vec<String> = order
            .iter()
            .filter(|url| !inner.unavailable_until.contains_key(*url))
            .cloned()
            .collect();
        if available.is_empty() { order } else { available }
    }

    pub fn pick(&self) -> Option<String> {
        self.ordered().into_iter().next()
    }

    pub fn mark_success(&self, url: &str) {
        let mut inner = self.inner.lock().expect("url pool lock poisoned");
        inner.last_success = Some(url.to_string());
        inner.unavailable_until.remove(url);
    }

    pub fn mark_unavailable(&self, url: &str) {
        let mut inner = self.inner.lock().expect("url pool lock poisoned");
        inner
            .unavailable_until
            .insert(url.to_string(), Instant::now() + self.unavailable_ttl);
        if inner.last_success.as_deref() == Some(url) {
            inner.last_success = None;
        }
    }
}

/// The gemini-cli v1internal envelope: wraps the generic gemini body in
/// `{project, requestId, userAgent, requestType, model, request}` and
/// unwraps `{response, responseId}` coming back. The upstream model name
/// travels at the top level only.
pub struct GeminiCliEnvelope {
    pub project_id: String,
    pub user_agent: String,
    pub urls: UrlPool,
}

impl GeminiCliEnvelope {
    pub const REQUEST_TYPE: &'static str = "agent";

    pub fn new(project_id: impl Into<String>, urls: UrlPool) -> Self {
        Self {
            project_id: project_id.into(),
            user_agent: "omnigate-gemini-cli".to_string(),
            urls,
        }
    }
}

impl VariantHook for GeminiCliEnvelope {
    fn wrap_request(&self, body: Value, model: &str) -> Value {
        let mut inner = body;
        if let Value::Object(map) = &mut inner {
            map.remove("model");
        }
        serde_json::json!({
            "project": self.project_id,
            "requestId": uuid::Uuid::new_v4().to_string(),
            "userAgent": self.user_agent,
            "requestType": Self::REQUEST_TYPE,
            "model": model,
            "request": inner,
        })
    }

    fn extra_headers(&self) -> Vec<(String, String)> {
        vec![("user-agent".to_string(), self.user_agent.clone())]
    }

    fn unwrap_response(&self, body: Value) -> Value {
        let Value::Object(map) = &body else {
            return body;
        };
        let Some(inner) = map.get("response") else {
            return body;
        };
        let mut unwrapped = inner.clone();
        if let Some(response_id) = map.get("responseId")
            && let Value::Object(out) = &mut unwrapped
        {
            out.insert("responseId".to_string(), response_id.clone());
        }
        unwrapped
    }

    fn select_base_url(&self) -> Option<String> {
        self.urls.pick()
    }

    fn on_http_status(&self, base_url: &str, status: u16) {
        if status == 429 || status >= 500 {
            self.urls.mark_unavailable(base_url);
        } else if (200..300).contains(&status) {
            self.urls.mark_success(base_url);
        }
    }

    fn on_connection_error(&self, base_url: &str) {
        self.urls.mark_unavailable(base_url);
    }

    fn force_stream_rewrite(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pool() -> UrlPool {
        UrlPool::new(
            vec!["https://daily.example".into(), "https://prod.example".into()],
            Duration::from_millis(50),
        )
    }

    #[test]
    fn envelope_wraps_and_strips_inner_model() {
        let hook = GeminiCliEnvelope::new("proj-1", pool());
        let wrapped = hook.wrap_request(
            json!({"model": "gemini-2.0-flash", "contents": []}),
            "gemini-2.0-flash",
        );
        assert_eq!(wrapped["project"], "proj-1");
        assert_eq!(wrapped["model"], "gemini-2.0-flash");
        assert_eq!(wrapped["requestType"], "agent");
        assert!(wrapped["request"].get("model").is_none());
        assert!(wrapped["requestId"].as_str().is_some());
    }

    #[test]
    fn envelope_unwraps_response_with_id() {
        let hook = GeminiCliEnvelope::new("proj-1", pool());
        let unwrapped = hook.unwrap_response(json!({
            "response": {"candidates": []},
            "responseId": "r-1"
        }));
        assert_eq!(unwrapped["responseId"], "r-1");
        assert!(unwrapped.get("candidates").is_some());
    }

    #[test]
    fn unwrap_passes_through_non_envelope_bodies() {
        let hook = GeminiCliEnvelope::new("proj-1", pool());
        let body = json!({"candidates": []});
        assert_eq!(hook.unwrap_response(body.clone()), body);
    }

    #[test]
    fn url_pool_demotes_and_recovers() {
        let pool = pool();
        assert_eq!(pool.pick().unwrap(), "https://daily.example");

        pool.mark_unavailable("https://daily.example");
        assert_eq!(pool.pick().unwrap(), "https://prod.example");

        // All demoted: base order still returned.
        pool.mark_unavailable("https://prod.example");
        assert_eq!(pool.ordered().len(), 2);

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(pool.pick().unwrap(), "https://daily.example");
    }

    #[test]
    fn last_success_is_promoted() {
        let pool = pool();
        pool.mark_success("https://prod.example");
        assert_eq!(pool.pick().unwrap(), "https://prod.example");
    }
}
