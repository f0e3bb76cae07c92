//! OpenAI chat completions request → Claude messages request.

use omnigate_common::ApiFamily;
use omnigate_protocol::{JsonObject, claude, openai};
use serde_json::Value;

use super::{emit_body, parse_body, split_data_url, stop_sequences};
use crate::registry::TransformError;

const DEFAULT_MAX_TOKENS: u64 = 4096;

pub fn convert(body: Value) -> Result<Value, TransformError> {
    let request: openai::ChatCompletionRequest = parse_body(body, ApiFamily::OpenAI)?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<claude::MessageParam> = Vec::new();

    for message in &request.messages {
        match message.role {
            openai::ChatRole::System | openai::ChatRole::Developer => {
                if let Some(content) = &message.content {
                    system_parts.push(content.plain_text());
                }
            }
            openai::ChatRole::User => {
                messages.push(claude::MessageParam {
                    role: claude::MessageRole::User,
                    content: claude::MessageContent::Blocks(user_blocks(message)),
                });
            }
            openai::ChatRole::Assistant => {
                messages.push(claude::MessageParam {
                    role: claude::MessageRole::Assistant,
                    content: claude::MessageContent::Blocks(assistant_blocks(message)),
                });
            }
            openai::ChatRole::Tool => {
                let tool_use_id = message.tool_call_id.clone().unwrap_or_default();
                let content = message
                    .content
                    .as_ref()
                    .map(|content| Value::String(content.plain_text()));
                messages.push(claude::MessageParam {
                    role: claude::MessageRole::User,
                    content: claude::MessageContent::Blocks(vec![claude::ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error: None,
                        cache_control: None,
                    }]),
                });
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| claude::ToolDef {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                input_schema: tool
                    .function
                    .parameters
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                cache_control: None,
            })
            .collect()
    });

    let converted = claude::CreateMessageRequest {
        model: request.model.clone(),
        max_tokens: request.effective_max_tokens().unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: (!system_parts.is_empty())
            .then(|| claude::SystemPrompt::Text(system_parts.join("\n\n"))),
        stream: request.stream,
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: request.stop.as_ref().and_then(stop_sequences),
        tools,
        tool_choice: request.tool_choice.as_ref().and_then(tool_choice),
        thinking: None,
        metadata: request.user.clone().map(|user_id| claude::Metadata {
            user_id: Some(user_id),
        }),
        extra: JsonObject::new(),
    };
    emit_body(&converted, ApiFamily::Claude)
}

fn user_blocks(message: &openai::ChatMessage) -> Vec<claude::ContentBlock> {
    let Some(content) = &message.content else {
        return Vec::new();
    };
    match content {
        openai::MessageContent::Text(text) => vec![claude::ContentBlock::text(text.clone())],
        openai::MessageContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                openai::ContentPart::Text { text } => claude::ContentBlock::text(text.clone()),
                openai::ContentPart::ImageUrl { image_url } => {
                    let source = match split_data_url(&image_url.url) {
                        Some((media_type, data)) => claude::ImageSource::Base64 { media_type, data },
                        None => claude::ImageSource::Url {
                            url: image_url.url.clone(),
                        },
                    };
                    claude::ContentBlock::Image {
                        source,
                        cache_control: None,
                    }
                }
            })
            .collect(),
    }
}

fn assistant_blocks(message: &openai::ChatMessage) -> Vec<claude::ContentBlock> {
    let mut blocks = Vec::new();
    if let Some(content) = &message.content {
        let text = content.plain_text();
        if !text.is_empty() {
            blocks.push(claude::ContentBlock::text(text));
        }
    }
    for call in message.tool_calls.iter().flatten() {
        let input = serde_json::from_str(&call.function.arguments)
            .unwrap_or(Value::Object(Default::default()));
        blocks.push(claude::ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input,
            cache_control: None,
        });
    }
    blocks
}

fn tool_choice(choice: &Value) -> Option<claude::ToolChoice> {
    match choice {
        Value::String(text) => match text.as_str() {
            "auto" => Some(claude::ToolChoice::Auto),
            "none" => Some(claude::ToolChoice::None),
            "required" => Some(claude::ToolChoice::Any),
            _ => None,
        },
        Value::Object(map) => map
            .get("function")
            .and_then(|function| function.get("name"))
            .and_then(|name| name.as_str())
            .map(|name| claude::ToolChoice::Tool {
                name: name.to_string(),
            }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn basic_chat_converts() {
        let body = json!({
            "model": "claude-sonnet-4",
            "stream": true,
            "max_tokens": 128,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ]
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["system"], "be brief");
        assert_eq!(converted["max_tokens"], 128);
        assert_eq!(converted["messages"][0]["role"], "user");
        assert_eq!(converted["messages"][0]["content"][0]["text"], "hi");
    }

    #[test]
    fn tool_round_trip_structures_survive() {
        let body = json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "assistant", "tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ],
            "tools": [{"type": "function", "function": {
                "name": "get_weather",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
            }}],
            "tool_choice": "required"
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["messages"][1]["content"][0]["type"], "tool_use");
        assert_eq!(converted["messages"][1]["content"][0]["input"]["city"], "SF");
        assert_eq!(converted["messages"][2]["content"][0]["type"], "tool_result");
        assert_eq!(converted["tools"][0]["name"], "get_weather");
        assert_eq!(converted["tool_choice"]["type"], "any");
    }

    #[test]
    fn vision_parts_become_image_blocks() {
        let body = json!({
            "model": "m",
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "what is this"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,QUJD"}}
            ]}]
        });
        let converted = convert(body).unwrap();
        let image = &converted["messages"][0]["content"][1];
        assert_eq!(image["type"], "image");
        assert_eq!(image["source"]["media_type"], "image/png");
        assert_eq!(image["source"]["data"], "QUJD");
    }

    #[test]
    fn missing_max_tokens_gets_a_default() {
        let body = json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]});
        let converted = convert(body).unwrap();
        assert_eq!(converted["max_tokens"], DEFAULT_MAX_TOKENS);
    }
}
