//! Request-body converters between chat-capable wire formats.

pub mod claude2gemini;
pub mod claude2openai;
pub mod gemini2claude;
pub mod gemini2openai;
pub mod openai2claude;
pub mod openai2gemini;
pub mod openai_chat2response;
pub mod openai_response2chat;

use omnigate_common::ApiFamily;
use serde_json::Value;

use crate::registry::TransformError;

pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(
    body: Value,
    family: ApiFamily,
) -> Result<T, TransformError> {
    serde_json::from_value(body).map_err(|err| TransformError::InvalidBody {
        family,
        reason: err.to_string(),
    })
}

pub(crate) fn emit_body<T: serde::Serialize>(
    value: &T,
    family: ApiFamily,
) -> Result<Value, TransformError> {
    serde_json::to_value(value).map_err(|err| TransformError::InvalidBody {
        family,
        reason: err.to_string(),
    })
}

/// Split a `data:media/type;base64,AAAA` URL into (media_type, data).
pub(crate) fn split_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some((media_type.to_string(), data.to_string()))
}

pub(crate) fn to_data_url(media_type: &str, data: &str) -> String {
    format!("data:{media_type};base64,{data}")
}

/// openai `stop` may be a string or an array of strings.
pub(crate) fn stop_sequences(stop: &Value) -> Option<Vec<String>> {
    match stop {
        Value::String(text) => Some(vec![text.clone()]),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_url_round_trip() {
        let url = to_data_url("image/png", "AAAA");
        let (media_type, data) = split_data_url(&url).unwrap();
        assert_eq!(media_type, "image/png");
        assert_eq!(data, "AAAA");
    }

    #[test]
    fn plain_urls_are_not_data_urls() {
        assert!(split_data_url("https://example.com/cat.png").is_none());
    }
}
