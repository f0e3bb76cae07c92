//! OpenAI Responses request → OpenAI chat completions request.

use omnigate_common::ApiFamily;
use omnigate_protocol::{JsonObject, openai};
use serde_json::Value;

use super::{emit_body, parse_body};
use crate::registry::TransformError;

pub fn convert(body: Value) -> Result<Value, TransformError> {
    let request: openai::ResponsesRequest = parse_body(body, ApiFamily::OpenAI)?;

    let mut messages: Vec<openai::ChatMessage> = Vec::new();
    if let Some(instructions) = &request.instructions
        && !instructions.is_empty()
    {
        messages.push(openai::ChatMessage::text(
            openai::ChatRole::System,
            instructions.clone(),
        ));
    }

    for item in request.input.iter().flat_map(|input| input.items()) {
        match item {
            openai::ResponseInputItem::Message { role, content } => {
                let role = match role.as_str() {
                    "assistant" => openai::ChatRole::Assistant,
                    "system" | "developer" => openai::ChatRole::System,
                    _ => openai::ChatRole::User,
                };
                messages.push(openai::ChatMessage {
                    role,
                    content: Some(chat_content(&content)),
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                    reasoning_content: None,
                    extra: JsonObject::new(),
                });
            }
            openai::ResponseInputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                messages.push(openai::ChatMessage {
                    role: openai::ChatRole::Assistant,
                    content: None,
                    name: None,
                    tool_calls: Some(vec![openai::ToolCall {
                        id: call_id,
                        r#type: "function".to_string(),
                        function: openai::FunctionCall { name, arguments },
                    }]),
                    tool_call_id: None,
                    reasoning_content: None,
                    extra: JsonObject::new(),
                });
            }
            openai::ResponseInputItem::FunctionCallOutput { call_id, output } => {
                messages.push(openai::ChatMessage {
                    role: openai::ChatRole::Tool,
                    content: Some(openai::MessageContent::Text(output)),
                    name: None,
                    tool_calls: None,
                    tool_call_id: Some(call_id),
                    reasoning_content: None,
                    extra: JsonObject::new(),
                });
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .filter(|tool| tool.r#type == "function")
            .map(|tool| openai::ChatTool {
                r#type: "function".to_string(),
                function: openai::FunctionDef {
                    name: tool.name.clone().unwrap_or_default(),
                    description: tool.description.clone(),
                    parameters: tool.parameters.clone(),
                },
            })
            .collect()
    });

    let converted = openai::ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        stream: request.stream,
        stream_options: request.stream.unwrap_or(false).then(|| openai::StreamOptions {
            include_usage: Some(true),
        }),
        max_tokens: request.max_output_tokens,
        max_completion_tokens: None,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: None,
        tools,
        tool_choice: request.tool_choice.as_ref().map(tool_choice),
        user: request.user.clone(),
        extra: JsonObject::new(),
    };
    emit_body(&converted, ApiFamily::OpenAI)
}

fn chat_content(content: &openai::ResponseContent) -> openai::MessageContent {
    match content {
        openai::ResponseContent::Text(text) => openai::MessageContent::Text(text.clone()),
        openai::ResponseContent::Parts(parts) => {
            let converted: Vec<openai::ContentPart> = parts
                .iter()
                .filter_map(|part| match part {
                    openai::ResponseContentPart::InputText { text }
                    | openai::ResponseContentPart::OutputText { text } => {
                        Some(openai::ContentPart::Text { text: text.clone() })
                    }
                    openai::ResponseContentPart::InputImage { image_url } => {
                        Some(openai::ContentPart::ImageUrl {
                            image_url: openai::ImageUrl {
                                url: image_url.clone(),
                                detail: None,
                            },
                        })
                    }
                    openai::ResponseContentPart::Refusal { .. } => None,
                })
                .collect();
            if converted.len() == 1
                && let openai::ContentPart::Text { text } = &converted[0]
            {
                openai::MessageContent::Text(text.clone())
            } else {
                openai::MessageContent::Parts(converted)
            }
        }
    }
}

/// Flat Responses tool_choice back into chat's nested form.
fn tool_choice(choice: &Value) -> Value {
    match choice {
        Value::Object(map)
            if map.get("type").and_then(Value::as_str) == Some("function")
                && map.get("name").is_some() =>
        {
            serde_json::json!({
                "type": "function",
                "function": {"name": map["name"]},
            })
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_items_become_messages() {
        let body = json!({
            "model": "gpt-5",
            "instructions": "be brief",
            "stream": true,
            "max_output_tokens": 64,
            "input": [
                {"type": "message", "role": "user", "content": "hi"},
                {"type": "function_call", "call_id": "call_1", "name": "f",
                 "arguments": "{}"},
                {"type": "function_call_output", "call_id": "call_1", "output": "ok"}
            ]
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["messages"][0]["role"], "system");
        assert_eq!(converted["messages"][0]["content"], "be brief");
        assert_eq!(converted["messages"][1]["content"], "hi");
        assert_eq!(converted["messages"][2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(converted["messages"][3]["role"], "tool");
        assert_eq!(converted["max_tokens"], 64);
        assert!(converted.get("input").is_none());
    }

    #[test]
    fn bare_string_input_is_a_user_message() {
        let body = json!({"model": "gpt-5", "input": "hello"});
        let converted = convert(body).unwrap();
        assert_eq!(converted["messages"][0]["role"], "user");
        assert_eq!(converted["messages"][0]["content"], "hello");
    }

    #[test]
    fn flat_tools_nest_back_into_functions() {
        let body = json!({
            "model": "m",
            "input": "q",
            "tools": [{"type": "function", "name": "f", "parameters": {"type": "object"}}],
            "tool_choice": {"type": "function", "name": "f"}
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["tools"][0]["function"]["name"], "f");
        assert_eq!(converted["tool_choice"]["function"]["name"], "f");
    }
}
