//! Gemini generateContent request → OpenAI chat completions request.

use omnigate_common::ApiFamily;
use omnigate_protocol::{JsonObject, gemini, openai};
use serde_json::Value;

use super::{emit_body, parse_body, to_data_url};
use crate::registry::TransformError;

pub fn convert(body: Value) -> Result<Value, TransformError> {
    let request: gemini::GenerateContentRequest = parse_body(body, ApiFamily::Gemini)?;

    let mut messages: Vec<openai::ChatMessage> = Vec::new();
    if let Some(system) = &request.system_instruction {
        let text: String = system
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            messages.push(openai::ChatMessage::text(openai::ChatRole::System, text));
        }
    }

    let mut call_counter = 0usize;
    for content in &request.contents {
        let is_model = content.role.as_deref() == Some("model");
        if is_model {
            append_model_content(&mut messages, content, &mut call_counter);
        } else {
            append_user_content(&mut messages, content);
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .flat_map(|tool| tool.function_declarations.iter().flatten())
            .map(|decl| openai::ChatTool {
                r#type: "function".to_string(),
                function: openai::FunctionDef {
                    name: decl.name.clone(),
                    description: decl.description.clone(),
                    parameters: decl.parameters.clone(),
                },
            })
            .collect::<Vec<_>>()
    });

    let config = request.generation_config.as_ref();
    let converted = openai::ChatCompletionRequest {
        model: request.model.clone().unwrap_or_default(),
        messages,
        stream: None,
        stream_options: None,
        max_tokens: config.and_then(|c| c.max_output_tokens),
        max_completion_tokens: None,
        temperature: config.and_then(|c| c.temperature),
        top_p: config.and_then(|c| c.top_p),
        stop: config
            .and_then(|c| c.stop_sequences.as_ref())
            .map(|stops| serde_json::json!(stops)),
        tools,
        tool_choice: request.tool_config.as_ref().and_then(tool_choice),
        user: None,
        extra: JsonObject::new(),
    };
    emit_body(&converted, ApiFamily::OpenAI)
}

fn append_user_content(messages: &mut Vec<openai::ChatMessage>, content: &gemini::Content) {
    let mut parts: Vec<openai::ContentPart> = Vec::new();
    for part in &content.parts {
        if let Some(text) = &part.text {
            parts.push(openai::ContentPart::Text { text: text.clone() });
        }
        if let Some(blob) = &part.inline_data {
            parts.push(openai::ContentPart::ImageUrl {
                image_url: openai::ImageUrl {
                    url: to_data_url(&blob.mime_type, &blob.data),
                    detail: None,
                },
            });
        }
        if let Some(response) = &part.function_response {
            messages.push(openai::ChatMessage {
                role: openai::ChatRole::Tool,
                content: Some(openai::MessageContent::Text(response.response.to_string())),
                name: Some(response.name.clone()),
                tool_calls: None,
                tool_call_id: Some(response.name.clone()),
                reasoning_content: None,
                extra: JsonObject::new(),
            });
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

fn append_model_content(
    messages: &mut Vec<openai::ChatMessage>,
    content: &gemini::Content,
    call_counter: &mut usize,
) {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls: Vec<openai::ToolCall> = Vec::new();
    for part in &content.parts {
        if let Some(chunk) = &part.text {
            if part.thought == Some(true) {
                reasoning.push_str(chunk);
            } else {
                text.push_str(chunk);
            }
        }
        if let Some(call) = &part.function_call {
            *call_counter += 1;
            tool_calls.push(openai::ToolCall {
                id: format!("call_{call_counter}"),
                r#type: "function".to_string(),
                function: openai::FunctionCall {
                    name: call.name.clone(),
                    arguments: call
                        .args
                        .as_ref()
                        .map(|args| args.to_string())
                        .unwrap_or_else(|| "{}".to_string()),
                },
            });
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

fn tool_choice(config: &gemini::ToolConfig) -> Option<Value> {
    let calling = config.function_calling_config.as_ref()?;
    match calling.mode.as_deref() {
        Some("AUTO") => Some(Value::String("auto".to_string())),
        Some("NONE") => Some(Value::String("none".to_string())),
        Some("ANY") => match calling
            .allowed_function_names
            .as_ref()
            .and_then(|names| names.first())
        {
            Some(name) => Some(serde_json::json!({
                "type": "function",
                "function": {"name": name},
            })),
            None => Some(Value::String("required".to_string())),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contents_map_to_messages() {
        let body = json!({
            "model": "gpt-4o",
            "systemInstruction": {"parts": [{"text": "be brief"}]},
            "contents": [
                {"role": "user", "parts": [{"text": "hi"}]},
                {"role": "model", "parts": [{"text": "hello"}]}
            ],
            "generationConfig": {"maxOutputTokens": 32}
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["messages"][0]["role"], "system");
        assert_eq!(converted["messages"][1]["content"], "hi");
        assert_eq!(converted["messages"][2]["role"], "assistant");
        assert_eq!(converted["max_tokens"], 32);
    }

    #[test]
    fn function_calls_synthesize_ids() {
        let body = json!({
            "contents": [
                {"role": "model", "parts": [{"functionCall": {"name": "f", "args": {"x": 1}}}]}
            ]
        });
        let converted = convert(body).unwrap();
        let call = &converted["messages"][0]["tool_calls"][0];
        assert_eq!(call["id"], "call_1");
        assert_eq!(call["function"]["name"], "f");
    }
}
