//! OpenAI chat completions request → OpenAI Responses request.
//!
//! Same family, different wire shape: `messages` become `input` items,
//! system/developer prompts become `instructions`, and tools flatten.

use omnigate_common::ApiFamily;
use omnigate_protocol::{JsonObject, openai};
use serde_json::Value;

use super::{emit_body, parse_body};
use crate::registry::TransformError;

pub fn convert(body: Value) -> Result<Value, TransformError> {
    let request: openai::ChatCompletionRequest = parse_body(body, ApiFamily::OpenAI)?;

    let mut instructions: Vec<String> = Vec::new();
    let mut items: Vec<openai::ResponseInputItem> = Vec::new();

    for message in &request.messages {
        match message.role {
            openai::ChatRole::System | openai::ChatRole::Developer => {
                if let Some(content) = &message.content {
                    instructions.push(content.plain_text());
                }
            }
            openai::ChatRole::User => {
                if let Some(content) = &message.content {
                    items.push(openai::ResponseInputItem::Message {
                        role: "user".to_string(),
                        content: message_content(content),
                    });
                }
            }
            openai::ChatRole::Assistant => {
                if let Some(content) = &message.content {
                    let text = content.plain_text();
                    if !text.is_empty() {
                        items.push(openai::ResponseInputItem::Message {
                            role: "assistant".to_string(),
                            content: openai::ResponseContent::Parts(vec![
                                openai::ResponseContentPart::OutputText { text },
                            ]),
                        });
                    }
                }
                for call in message.tool_calls.iter().flatten() {
                    items.push(openai::ResponseInputItem::FunctionCall {
                        call_id: call.id.clone(),
                        name: call.function.name.clone(),
                        arguments: call.function.arguments.clone(),
                    });
                }
            }
            openai::ChatRole::Tool => {
                items.push(openai::ResponseInputItem::FunctionCallOutput {
                    call_id: message.tool_call_id.clone().unwrap_or_default(),
                    output: message
                        .content
                        .as_ref()
                        .map(|content| content.plain_text())
                        .unwrap_or_default(),
                });
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| openai::ResponsesTool {
                r#type: "function".to_string(),
                name: Some(tool.function.name.clone()),
                description: tool.function.description.clone(),
                parameters: tool.function.parameters.clone(),
                extra: JsonObject::new(),
            })
            .collect()
    });

    let converted = openai::ResponsesRequest {
        model: request.model.clone(),
        input: Some(openai::ResponsesInput::Items(items)),
        instructions: (!instructions.is_empty()).then(|| instructions.join("\n\n")),
        stream: request.stream,
        store: None,
        include: None,
        max_output_tokens: request.effective_max_tokens(),
        temperature: request.temperature,
        top_p: request.top_p,
        tools,
        tool_choice: request.tool_choice.as_ref().map(tool_choice),
        parallel_tool_calls: None,
        user: request.user.clone(),
        extra: JsonObject::new(),
    };
    emit_body(&converted, ApiFamily::OpenAI)
}

fn message_content(content: &openai::MessageContent) -> openai::ResponseContent {
    match content {
        openai::MessageContent::Text(text) => openai::ResponseContent::Text(text.clone()),
        openai::MessageContent::Parts(parts) => openai::ResponseContent::Parts(
            parts
                .iter()
                .map(|part| match part {
                    openai::ContentPart::Text { text } => {
                        openai::ResponseContentPart::InputText { text: text.clone() }
                    }
                    openai::ContentPart::ImageUrl { image_url } => {
                        openai::ResponseContentPart::InputImage {
                            image_url: image_url.url.clone(),
                        }
                    }
                })
                .collect(),
        ),
    }
}

/// Responses tool_choice for a specific function is flat, not nested.
fn tool_choice(choice: &Value) -> Value {
    match choice {
        Value::Object(map) => map
            .get("function")
            .and_then(|function| function.get("name"))
            .and_then(|name| name.as_str())
            .map(|name| serde_json::json!({"type": "function", "name": name}))
            .unwrap_or_else(|| choice.clone()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn messages_become_input_items_and_instructions() {
        let body = json!({
            "model": "gpt-5",
            "stream": true,
            "max_tokens": 64,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"}
            ]
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["instructions"], "be brief");
        assert_eq!(converted["input"][0]["type"], "message");
        assert_eq!(converted["input"][0]["role"], "user");
        assert_eq!(converted["input"][0]["content"], "hi");
        assert_eq!(converted["max_output_tokens"], 64);
        assert!(converted.get("messages").is_none());
    }

    #[test]
    fn tool_calls_flatten_to_function_items() {
        let body = json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "tool_calls": [{
                    "id": "call_1", "type": "function",
                    "function": {"name": "get_weather", "arguments": "{\"city\":\"SF\"}"}
                }]},
                {"role": "tool", "tool_call_id": "call_1", "content": "sunny"}
            ],
            "tools": [{"type": "function", "function": {
                "name": "get_weather", "parameters": {"type": "object"}
            }}],
            "tool_choice": {"type": "function", "function": {"name": "get_weather"}}
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["input"][0]["type"], "function_call");
        assert_eq!(converted["input"][0]["call_id"], "call_1");
        assert_eq!(converted["input"][1]["type"], "function_call_output");
        assert_eq!(converted["input"][1]["output"], "sunny");
        // Flat tool definition and flat tool_choice.
        assert_eq!(converted["tools"][0]["name"], "get_weather");
        assert!(converted["tools"][0].get("function").is_none());
        assert_eq!(converted["tool_choice"]["name"], "get_weather");
    }
}
