//! Claude messages request → Gemini generateContent request.

use omnigate_common::ApiFamily;
use omnigate_protocol::{JsonObject, claude, gemini};
use serde_json::Value;

use super::{emit_body, parse_body};
use crate::registry::TransformError;

pub fn convert(body: Value) -> Result<Value, TransformError> {
    let request: claude::CreateMessageRequest = parse_body(body, ApiFamily::Claude)?;

    let mut contents: Vec<gemini::Content> = Vec::new();
    for param in &request.messages {
        let role = match param.role {
            claude::MessageRole::User => "user",
            claude::MessageRole::Assistant => "model",
        };
        let parts = blocks_to_parts(&param.content.blocks());
        if !parts.is_empty() {
            contents.push(gemini::Content {
                role: Some(role.to_string()),
                parts,
            });
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        vec![gemini::Tool {
            function_declarations: Some(
                tools
                    .iter()
                    .map(|tool| gemini::FunctionDeclaration {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: Some(scrub_schema(tool.input_schema.clone())),
                    })
                    .collect(),
            ),
            extra: JsonObject::new(),
        }]
    });

    let thinking_config = match request.thinking {
        Some(claude::ThinkingConfig::Enabled { budget_tokens }) => Some(gemini::ThinkingConfig {
            include_thoughts: Some(true),
            thinking_budget: Some(budget_tokens as i64),
        }),
        _ => None,
    };

    let converted = gemini::GenerateContentRequest {
        model: Some(request.model.clone()),
        contents,
        system_instruction: request.system.as_ref().map(|system| gemini::Content {
            role: None,
            parts: vec![gemini::Part::text(system.plain_text())],
        }),
        generation_config: Some(gemini::GenerationConfig {
            max_output_tokens: Some(request.max_tokens),
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: request.top_k,
            stop_sequences: request.stop_sequences.clone(),
            response_mime_type: None,
            thinking_config,
            extra: JsonObject::new(),
        }),
        tools,
        tool_config: request.tool_choice.as_ref().map(tool_config),
        safety_settings: None,
        extra: JsonObject::new(),
    };
    emit_body(&converted, ApiFamily::Gemini)
}

fn blocks_to_parts(blocks: &[claude::ContentBlock]) -> Vec<gemini::Part> {
    let mut parts = Vec::new();
    for block in blocks {
        match block {
            claude::ContentBlock::Text { text, .. } => parts.push(gemini::Part::text(text.clone())),
            claude::ContentBlock::Image { source, .. } => {
                if let claude::ImageSource::Base64 { media_type, data } = source {
                    parts.push(gemini::Part {
                        inline_data: Some(gemini::Blob {
                            mime_type: media_type.clone(),
                            data: data.clone(),
                        }),
                        ..Default::default()
                    });
                }
            }
            claude::ContentBlock::ToolUse { name, input, .. } => parts.push(gemini::Part {
                function_call: Some(gemini::FunctionCall {
                    name: name.clone(),
                    args: Some(input.clone()),
                }),
                ..Default::default()
            }),
            claude::ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let response = match content {
                    Some(Value::Object(map)) => Value::Object(map.clone()),
                    Some(other) => serde_json::json!({"result": other}),
                    None => serde_json::json!({}),
                };
                parts.push(gemini::Part {
                    function_response: Some(gemini::FunctionResponse {
                        name: tool_use_id.clone(),
                        response,
                    }),
                    ..Default::default()
                });
            }
            claude::ContentBlock::Thinking {
                thinking,
                signature,
            } => parts.push(gemini::Part {
                text: Some(thinking.clone()),
                thought: Some(true),
                thought_signature: signature.clone(),
                ..Default::default()
            }),
            claude::ContentBlock::RedactedThinking { .. } => {}
        }
    }
    parts
}

/// Gemini rejects JSON-schema keys like `$schema`/`additionalProperties`.
fn scrub_schema(mut schema: Value) -> Value {
    if let Value::Object(map) = &mut schema {
        map.remove("$schema");
        map.remove("additionalProperties");
        for value in map.values_mut() {
            let scrubbed = scrub_schema(value.take());
            *value = scrubbed;
        }
    }
    schema
}

fn tool_config(choice: &claude::ToolChoice) -> gemini::ToolConfig {
    let (mode, allowed) = match choice {
        claude::ToolChoice::Auto => ("AUTO", None),
        claude::ToolChoice::Any => ("ANY", None),
        claude::ToolChoice::None => ("NONE", None),
        claude::ToolChoice::Tool { name } => ("ANY", Some(vec![name.clone()])),
    };
    gemini::ToolConfig {
        function_calling_config: Some(gemini::FunctionCallingConfig {
            mode: Some(mode.to_string()),
            allowed_function_names: allowed,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn max_tokens_maps_to_generation_config() {
        let body = json!({
            "model": "gemini-2.0-flash",
            "stream": true,
            "max_tokens": 64,
            "messages": [{"role": "user", "content": "hi"}]
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(converted["contents"][0]["role"], "user");
        assert_eq!(converted["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn system_prompt_becomes_system_instruction() {
        let body = json!({
            "model": "m", "max_tokens": 8,
            "system": "be terse",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let converted = convert(body).unwrap();
        assert_eq!(
            converted["systemInstruction"]["parts"][0]["text"],
            "be terse"
        );
    }

    #[test]
    fn thinking_config_carries_budget() {
        let body = json!({
            "model": "m", "max_tokens": 8,
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "messages": [{"role": "user", "content": "hi"}]
        });
        let converted = convert(body).unwrap();
        let thinking = &converted["generationConfig"]["thinkingConfig"];
        assert_eq!(thinking["includeThoughts"], true);
        assert_eq!(thinking["thinkingBudget"], 2048);
    }

    #[test]
    fn tool_schema_is_scrubbed() {
        let body = json!({
            "model": "m", "max_tokens": 8,
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "f", "input_schema": {
                "$schema": "http://json-schema.org/draft-07/schema#",
                "type": "object",
                "additionalProperties": false,
                "properties": {"x": {"type": "number"}}
            }}]
        });
        let converted = convert(body).unwrap();
        let parameters = &converted["tools"][0]["functionDeclarations"][0]["parameters"];
        assert!(parameters.get("$schema").is_none());
        assert!(parameters.get("additionalProperties").is_none());
        assert_eq!(parameters["properties"]["x"]["type"], "number");
    }
}
