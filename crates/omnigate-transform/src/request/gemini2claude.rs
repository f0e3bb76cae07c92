//! Gemini generateContent request → Claude messages request.

use omnigate_common::ApiFamily;
use omnigate_protocol::{JsonObject, claude, gemini};
use serde_json::Value;

use super::{emit_body, parse_body};
use crate::registry::TransformError;

const DEFAULT_MAX_TOKENS: u64 = 4096;

pub fn convert(body: Value) -> Result<Value, TransformError> {
    let request: gemini::GenerateContentRequest = parse_body(body, ApiFamily::Gemini)?;

    let mut messages: Vec<claude::MessageParam> = Vec::new();
    let mut tool_use_counter = 0usize;
    for content in &request.contents {
        let is_model = content.role.as_deref() == Some("model");
        let blocks = parts_to_blocks(&content.parts, &mut tool_use_counter);
        if blocks.is_empty() {
            continue;
        }
        messages.push(claude::MessageParam {
            role: if is_model {
                claude::MessageRole::Assistant
            } else {
                claude::MessageRole::User
            },
            content: claude::MessageContent::Blocks(blocks),
        });
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .flat_map(|tool| tool.function_declarations.iter().flatten())
            .map(|decl| claude::ToolDef {
                name: decl.name.clone(),
                description: decl.description.clone(),
                input_schema: decl
                    .parameters
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"})),
                cache_control: None,
            })
            .collect::<Vec<_>>()
    });

    let config = request.generation_config.as_ref();
    let thinking = config
        .and_then(|c| c.thinking_config.as_ref())
        .and_then(|thinking| thinking.thinking_budget)
        .map(|budget| claude::ThinkingConfig::Enabled {
            budget_tokens: budget.max(0) as u64,
        });

    let converted = claude::CreateMessageRequest {
        model: request.model.clone().unwrap_or_default(),
        max_tokens: config
            .and_then(|c| c.max_output_tokens)
            .unwrap_or(DEFAULT_MAX_TOKENS),
        messages,
        system: request.system_instruction.as_ref().map(|system| {
            claude::SystemPrompt::Text(
                system
                    .parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("\n"),
            )
        }),
        stream: None,
        temperature: config.and_then(|c| c.temperature),
        top_p: config.and_then(|c| c.top_p),
        top_k: config.and_then(|c| c.top_k),
        stop_sequences: config.and_then(|c| c.stop_sequences.clone()),
        tools,
        tool_choice: request.tool_config.as_ref().and_then(tool_choice),
        thinking,
        metadata: None,
        extra: JsonObject::new(),
    };
    emit_body(&converted, ApiFamily::Claude)
}

fn parts_to_blocks(
    parts: &[gemini::Part],
    tool_use_counter: &mut usize,
) -> Vec<claude::ContentBlock> {
    let mut blocks = Vec::new();
    for part in parts {
        if let Some(text) = &part.text {
            if part.thought == Some(true) {
                blocks.push(claude::ContentBlock::Thinking {
                    thinking: text.clone(),
                    signature: part.thought_signature.clone(),
                });
            } else {
                blocks.push(claude::ContentBlock::text(text.clone()));
            }
        }
        if let Some(blob) = &part.inline_data {
            blocks.push(claude::ContentBlock::Image {
                source: claude::ImageSource::Base64 {
                    media_type: blob.mime_type.clone(),
                    data: blob.data.clone(),
                },
                cache_control: None,
            });
        }
        if let Some(call) = &part.function_call {
            *tool_use_counter += 1;
            blocks.push(claude::ContentBlock::ToolUse {
                id: format!("toolu_{tool_use_counter}"),
                name: call.name.clone(),
                input: call.args.clone().unwrap_or_else(|| serde_json::json!({})),
                cache_control: None,
            });
        }
        if let Some(response) = &part.function_response {
            blocks.push(claude::ContentBlock::ToolResult {
                tool_use_id: response.name.clone(),
                content: Some(response.response.clone()),
                is_error: None,
                cache_control: None,
            });
        }
    }
    blocks
}

fn tool_choice(config: &gemini::ToolConfig) -> Option<claude::ToolChoice> {
    let calling = config.function_calling_config.as_ref()?;
    match calling.mode.as_deref() {
        Some("AUTO") => Some(claude::ToolChoice::Auto),
        Some("NONE") => Some(claude::ToolChoice::None),
        Some("ANY") => match calling
            .allowed_function_names
            .as_ref()
            .and_then(|names| names.first())
        {
            Some(name) => Some(claude::ToolChoice::Tool { name: name.clone() }),
            None => Some(claude::ToolChoice::Any),
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thought_parts_become_thinking_blocks() {
        let body = json!({
            "contents": [
                {"role": "model", "parts": [
                    {"text": "working...", "thought": true, "thoughtSignature": "sig"},
                    {"text": "answer"}
                ]}
            ]
        });
        let converted = convert(body).unwrap();
        let blocks = &converted["messages"][0]["content"];
        assert_eq!(blocks[0]["type"], "thinking");
        assert_eq!(blocks[0]["signature"], "sig");
        assert_eq!(blocks[1]["type"], "text");
    }

    #[test]
    fn generation_config_flows_through() {
        let body = json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"maxOutputTokens": 99, "topK": 5}
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["max_tokens"], 99);
        assert_eq!(converted["top_k"], 5);
    }
}
