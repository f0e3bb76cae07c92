//! Codex upstream compatibility: the Codex backend speaks the OpenAI
//! Responses schema but enforces extra constraints, so requests routed to a
//! provider tagged `codex` on an (openai, cli) endpoint get mutated before
//! forwarding.

use serde_json::{Value, json};

const REQUIRED_INCLUDE_ITEM: &str = "reasoning.encrypted_content";

const REJECTED_PARAMS: [&str; 6] = [
    "max_output_tokens",
    "max_completion_tokens",
    "max_tokens",
    "temperature",
    "top_p",
    "service_tier",
];

pub fn maybe_patch_for_codex(
    provider_type: Option<&str>,
    upstream_signature_key: &str,
    body: Value,
) -> Value {
    if provider_type.map(|t| t.trim().to_ascii_lowercase()) != Some("codex".to_string()) {
        return body;
    }
    if upstream_signature_key != "openai:cli" {
        return body;
    }
    patch_responses_request(body)
}

pub fn patch_responses_request(body: Value) -> Value {
    let Value::Object(mut map) = body else {
        return body;
    };

    // Codex rejects stored responses and requires instructions to exist.
    map.insert("store".to_string(), Value::Bool(false));
    match map.get("instructions") {
        None | Some(Value::Null) => {
            map.insert("instructions".to_string(), Value::String(String::new()));
        }
        Some(Value::String(_)) => {}
        Some(other) => {
            let text = other.to_string();
            map.insert("instructions".to_string(), Value::String(text));
        }
    }

    map.insert("parallel_tool_calls".to_string(), Value::Bool(true));

    let mut include: Vec<Value> = map
        .get("include")
        .and_then(|value| value.as_array())
        .map(|items| {
            items
                .iter()
                .filter(|item| item.as_str().is_some_and(|text| !text.is_empty()))
                .cloned()
                .collect()
        })
        .unwrap_or_default();
    if !include
        .iter()
        .any(|item| item.as_str() == Some(REQUIRED_INCLUDE_ITEM))
    {
        include.push(json!(REQUIRED_INCLUDE_ITEM));
    }
    map.insert("include".to_string(), Value::Array(include));

    for param in REJECTED_PARAMS {
        map.remove(param);
    }

    // Codex refuses `system` roles in the input array; they become
    // `developer` messages.
    if let Some(Value::Array(input)) = map.get_mut("input") {
        for item in input.iter_mut() {
            if let Value::Object(entry) = item
                && entry.get("type").and_then(Value::as_str) == Some("message")
                && entry.get("role").and_then(Value::as_str) == Some("system")
            {
                entry.insert("role".to_string(), Value::String("developer".to_string()));
            }
        }
    }

    Value::Object(map)
}
