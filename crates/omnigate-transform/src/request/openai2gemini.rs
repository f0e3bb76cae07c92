//! OpenAI chat completions request → Gemini generateContent request.

use std::collections::HashMap;

use omnigate_common::ApiFamily;
use omnigate_protocol::{JsonObject, gemini, openai};
use serde_json::Value;

use super::{emit_body, parse_body, split_data_url, stop_sequences};
use crate::registry::TransformError;

pub fn convert(body: Value) -> Result<Value, TransformError> {
    let request: openai::ChatCompletionRequest = parse_body(body, ApiFamily::OpenAI)?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut contents: Vec<gemini::Content> = Vec::new();
    // tool_call_id -> function name, for functionResponse attribution.
    let mut call_names: HashMap<String, String> = HashMap::new();

    for message in &request.messages {
        match message.role {
            openai::ChatRole::System | openai::ChatRole::Developer => {
                if let Some(content) = &message.content {
                    system_parts.push(content.plain_text());
                }
            }
            openai::ChatRole::User => {
                let parts = user_parts(message);
                if !parts.is_empty() {
                    contents.push(gemini::Content::user(parts));
                }
            }
            openai::ChatRole::Assistant => {
                let mut parts: Vec<gemini::Part> = Vec::new();
                if let Some(content) = &message.content {
                    let text = content.plain_text();
                    if !text.is_empty() {
                        parts.push(gemini::Part::text(text));
                    }
                }
                for call in message.tool_calls.iter().flatten() {
                    call_names.insert(call.id.clone(), call.function.name.clone());
                    parts.push(gemini::Part {
                        function_call: Some(gemini::FunctionCall {
                            name: call.function.name.clone(),
                            args: serde_json::from_str(&call.function.arguments).ok(),
                        }),
                        ..Default::default()
                    });
                }
                if !parts.is_empty() {
                    contents.push(gemini::Content::model(parts));
                }
            }
            openai::ChatRole::Tool => {
                let name = message
                    .tool_call_id
                    .as_ref()
                    .and_then(|id| call_names.get(id).cloned())
                    .unwrap_or_else(|| "tool".to_string());
                let text = message
                    .content
                    .as_ref()
                    .map(|content| content.plain_text())
                    .unwrap_or_default();
                let response = serde_json::from_str(&text)
                    .unwrap_or_else(|_| serde_json::json!({"result": text}));
                contents.push(gemini::Content::user(vec![gemini::Part {
                    function_response: Some(gemini::FunctionResponse { name, response }),
                    ..Default::default()
                }]));
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        vec![gemini::Tool {
            function_declarations: Some(
                tools
                    .iter()
                    .map(|tool| gemini::FunctionDeclaration {
                        name: tool.function.name.clone(),
                        description: tool.function.description.clone(),
                        parameters: tool.function.parameters.clone(),
                    })
                    .collect(),
            ),
            extra: JsonObject::new(),
        }]
    });

    let converted = gemini::GenerateContentRequest {
        model: Some(request.model.clone()),
        contents,
        system_instruction: (!system_parts.is_empty()).then(|| gemini::Content {
            role: None,
            parts: vec![gemini::Part::text(system_parts.join("\n\n"))],
        }),
        generation_config: Some(gemini::GenerationConfig {
            max_output_tokens: request.effective_max_tokens(),
            temperature: request.temperature,
            top_p: request.top_p,
            top_k: None,
            stop_sequences: request.stop.as_ref().and_then(stop_sequences),
            response_mime_type: None,
            thinking_config: None,
            extra: JsonObject::new(),
        }),
        tools,
        tool_config: request.tool_choice.as_ref().and_then(tool_config),
        safety_settings: None,
        extra: JsonObject::new(),
    };
    emit_body(&converted, ApiFamily::Gemini)
}

fn user_parts(message: &openai::ChatMessage) -> Vec<gemini::Part> {
    let Some(content) = &message.content else {
        return Vec::new();
    };
    match content {
        openai::MessageContent::Text(text) => vec![gemini::Part::text(text.clone())],
        openai::MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                openai::ContentPart::Text { text } => Some(gemini::Part::text(text.clone())),
                openai::ContentPart::ImageUrl { image_url } => {
                    split_data_url(&image_url.url).map(|(mime_type, data)| gemini::Part {
                        inline_data: Some(gemini::Blob { mime_type, data }),
                        ..Default::default()
                    })
                }
            })
            .collect(),
    }
}

fn tool_config(choice: &Value) -> Option<gemini::ToolConfig> {
    let (mode, allowed) = match choice {
        Value::String(text) => match text.as_str() {
            "auto" => ("AUTO", None),
            "none" => ("NONE", None),
            "required" => ("ANY", None),
            _ => return None,
        },
        Value::Object(map) => {
            let name = map
                .get("function")
                .and_then(|function| function.get("name"))
                .and_then(|name| name.as_str())?;
            ("ANY", Some(vec![name.to_string()]))
        }
        _ => return None,
    };
    Some(gemini::ToolConfig {
        function_calling_config: Some(gemini::FunctionCallingConfig {
            mode: Some(mode.to_string()),
            allowed_function_names: allowed,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roles_and_config_map() {
        let body = json!({
            "model": "gemini-2.0-flash",
            "max_tokens": 100,
            "temperature": 0.5,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
                {"role": "user", "content": "bye"}
            ]
        });
        let converted = convert(body).unwrap();
        assert_eq!(converted["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(converted["contents"][0]["role"], "user");
        assert_eq!(converted["contents"][1]["role"], "model");
        assert_eq!(converted["generationConfig"]["maxOutputTokens"], 100);
    }

    #[test]
    fn tool_responses_attribute_by_call_id() {
        let body = json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "tool_calls": [{
                    "id": "call_9", "type": "function",
                    "function": {"name": "lookup", "arguments": "{}"}
                }]},
                {"role": "tool", "tool_call_id": "call_9", "content": "{\"answer\": 42}"}
            ]
        });
        let converted = convert(body).unwrap();
        let response_part = &converted["contents"][1]["parts"][0]["functionResponse"];
        assert_eq!(response_part["name"], "lookup");
        assert_eq!(response_part["response"]["answer"], 42);
    }
}
