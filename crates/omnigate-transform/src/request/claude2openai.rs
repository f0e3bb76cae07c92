//! Claude messages request → OpenAI chat completions request.

use omnigate_common::ApiFamily;
use omnigate_protocol::{JsonObject, claude, openai};
use serde_json::Value;

use super::{emit_body, parse_body, to_data_url};
use crate::registry::TransformError;

pub fn convert(body: Value) -> Result<Value, TransformError> {
    let request: claude::CreateMessageRequest = parse_body(body, ApiFamily::Claude)?;

    let mut messages: Vec<openai::ChatMessage> = Vec::new();
    if let Some(system) = &request.system {
        messages.push(openai::ChatMessage::text(
            openai::ChatRole::System,
            system.plain_text(),
        ));
    }

    for param in &request.messages {
        match param.role {
            claude::MessageRole::User => append_user(&mut messages, param),
            claude::MessageRole::Assistant => append_assistant(&mut messages, param),
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|tool| openai::ChatTool {
                r#type: "function".to_string(),
                function: openai::FunctionDef {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: Some(tool.input_schema.clone()),
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
        max_tokens: Some(request.max_tokens),
        max_completion_tokens: None,
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request
            .stop_sequences
            .as_ref()
            .map(|stops| serde_json::json!(stops)),
        tools,
        tool_choice: request.tool_choice.as_ref().map(tool_choice),
        user: request
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.user_id.clone()),
        extra: JsonObject::new(),
    };
    emit_body(&converted, ApiFamily::OpenAI)
}

fn append_user(messages: &mut Vec<openai::ChatMessage>, param: &claude::MessageParam) {
    let mut parts: Vec<openai::ContentPart> = Vec::new();
    for block in param.content.blocks() {
        match block {
            claude::ContentBlock::Text { text, .. } => {
                parts.push(openai::ContentPart::Text { text });
            }
            claude::ContentBlock::Image { source, .. } => {
                let url = match source {
                    claude::ImageSource::Base64 { media_type, data } => {
                        to_data_url(&media_type, &data)
                    }
                    claude::ImageSource::Url { url } => url,
                };
                parts.push(openai::ContentPart::ImageUrl {
                    image_url: openai::ImageUrl { url, detail: None },
                });
            }
            claude::ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                // Tool results become their own `tool` role message.
                let text = match content {
                    Some(Value::String(text)) => text,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                messages.push(openai::ChatMessage {
                    role: openai::ChatRole::Tool,
                    content: Some(openai::MessageContent::Text(text)),
                    name: None,
                    tool_calls: None,
                    tool_call_id: Some(tool_use_id),
                    reasoning_content: None,
                    extra: JsonObject::new(),
                });
            }
            _ => {}
        }
    }
    if !parts.is_empty() {
        let content = if parts.len() == 1
            && let openai::ContentPart::Text { text } = &parts[0]
        {
            openai::MessageContent::Text(text.clone())
        } else {
            openai::MessageContent::Parts(parts)
        };
        messages.push(openai::ChatMessage {
            role: openai::ChatRole::User,
            content: Some(content),
            name: None,
            tool_calls: None,
            tool_call_id: None,
            reasoning_content: None,
            extra: JsonObject::new(),
        });
    }
}

fn append_assistant(messages: &mut Vec<openai::ChatMessage>, param: &claude::MessageParam) {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<openai::ToolCall> = Vec::new();
    for block in param.content.blocks() {
        match block {
            claude::ContentBlock::Text { text: chunk, .. } => text.push_str(&chunk),
            claude::ContentBlock::Thinking { thinking, .. } => reasoning.push_str(&thinking),
            claude::ContentBlock::ToolUse { id, name, input, .. } => {
                tool_calls.push(openai::ToolCall {
                    id,
                    r#type: "function".to_string(),
                    function: openai::FunctionCall {
                        name,
                        arguments: input.to_string(),
                    },
                });
            }
            _ => {}
        }
    }
    messages.push(openai::ChatMessage {
        role: openai::ChatRole::Assistant,
        content: (!text.is_empty()).then_some(openai::MessageContent::Text(text)),
        name: None,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: None,
        reasoning_content: (!reasoning.is_empty()).then_some(reasoning),
        extra: JsonObject::new(),
    });
}

fn tool_choice(choice: &claude::ToolChoice) -> Value {
    match choice {
        claude::ToolChoice::Auto => Value::String("auto".to_string()),
        claude::ToolChoice::Any => Value::String("required".to_string()),
        claude::ToolChoice::None => Value::String("none".to_string()),
        claude::ToolChoice::Tool { name } => serde_json::json!({
            "type": "function",
            "function": {"name": name},
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn system_and_roles_map() {
        let body = json!({
            "model": "gpt-4o",
            "max_tokens": 64,
            "system": "be brief",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["messages"][0]["role"], "system");
        assert_eq!(converted["messages"][1]["role"], "user");
        assert_eq!(converted["messages"][1]["content"], "hi");
        assert_eq!(converted["max_tokens"], 64);
    }

    #[test]
    fn tool_use_becomes_tool_calls() {
        let body = json!({
            "model": "m",
            "max_tokens": 64,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "get_weather",
                     "input": {"city": "SF"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "sunny"}
                ]}
            ]
        });
        let converted = convert(body).unwrap();
        let call = &converted["messages"][0]["tool_calls"][0];
        assert_eq!(call["id"], "toolu_1");
        assert_eq!(call["function"]["name"], "get_weather");
        assert_eq!(converted["messages"][1]["role"], "tool");
        assert_eq!(converted["messages"][1]["tool_call_id"], "toolu_1");
    }

    #[test]
    fn stream_requests_ask_for_usage() {
        let body = json!({
            "model": "m", "max_tokens": 1, "stream": true,
            "messages": [{"role": "user", "content": "hi"}]
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["stream_options"]["include_usage"], true);
    }
}
