//! Process-scoped TTL cache for gemini-cli thought signatures.
//!
//! The upstream attaches an opaque signature to thinking parts; follow-up
//! requests must replay the most recent one per model for the thinking
//! chain to validate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct ThoughtSignatureCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl ThoughtSignatureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, model: &str, signature: &str) {
        if signature.is_empty() {
            return;
        }
        let mut entries = self.entries.lock().expect("signature cache poisoned");
        entries.insert(model.to_string(), (signature.to_string(), Instant::now()));
    }

    pub fn get(&self, model: &str) -> Option<String> {
        let mut entries = self.entries.lock().expect("signature cache poisoned");
        match entries.get(model) {
            Some((signature, stored_at)) if stored_at.elapsed() < self.ttl => {
                Some(signature.clone())
            }
            Some(_) => {
                entries.remove(model);
                None
            }
            None => None,
        }
    }

    /// Pull signatures out of a gemini response body and remember the last
    /// one per model.
    pub fn capture_from_response(&self, model: &str, body: &serde_json::Value) {
        let Some(candidates) = body.get("candidates").and_then(|v| v.as_array()) else {
            return;
        };
        for candidate in candidates {
            let Some(parts) = candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(|parts| parts.as_array())
            else {
                continue;
            };
            for part in parts {
                if let Some(signature) = part.get("thoughtSignature").and_then(|v| v.as_str()) {
                    self.store(model, signature);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_expires() {
        let cache = ThoughtSignatureCache::new(Duration::from_millis(40));
        cache.store("gemini-2.0-flash", "sig-1");
        assert_eq!(cache.get("gemini-2.0-flash").as_deref(), Some("sig-1"));
        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get("gemini-2.0-flash").is_none());
    }

    #[test]
    fn captures_from_response_parts() {
        let cache = ThoughtSignatureCache::new(Duration::from_secs(60));
        cache.capture_from_response(
            "m",
            &serde_json::json!({
                "candidates": [{"content": {"parts": [
                    {"text": "t", "thought": true, "thoughtSignature": "sig-9"}
                ]}}]
            }),
        );
        assert_eq!(cache.get("m").as_deref(), Some("sig-9"));
    }

    #[test]
    fn empty_signatures_are_ignored() {
        let cache = ThoughtSignatureCache::new(Duration::from_secs(60));
        cache.store("m", "");
        assert!(cache.get("m").is_none());
    }
}
