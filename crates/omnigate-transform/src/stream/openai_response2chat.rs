//! OpenAI Responses stream → OpenAI chat-completions stream.

use std::collections::HashMap;

use omnigate_protocol::openai;
use omnigate_protocol::sse::SseFrame;
use omnigate_protocol::usage::TokenUsage;

use super::json_frame;

pub struct State {
    chunk_id: String,
    model: String,
    created: i64,
    finished: bool,
    role_sent: bool,
    /// responses output_index -> chat tool index.
    tool_indexes: HashMap<i64, i64>,
    next_tool_index: i64,
    saw_tool_call: bool,
    usage: TokenUsage,
}

impl State {
    pub fn new(model: &str) -> Self {
        Self {
            chunk_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs() as i64)
                .unwrap_or(0),
            finished: false,
            role_sent: false,
            tool_indexes: HashMap::new(),
            next_tool_index: 0,
            saw_tool_call: false,
            usage: TokenUsage::default(),
        }
    }

    fn chunk(&self, delta: openai::ChatDelta, finish_reason: Option<String>) -> SseFrame {
        json_frame(&openai::ChatCompletionChunk {
            id: self.chunk_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![openai::StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
            extra: Default::default(),
        })
    }

    pub fn push(&mut self, frame: &SseFrame) -> Vec<SseFrame> {
        let Ok(event) = serde_json::from_str::<openai::ResponseStreamEvent>(&frame.data) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if !self.role_sent {
            self.role_sent = true;
            out.push(self.chunk(
                openai::ChatDelta {
                    role: Some(openai::ChatRole::Assistant),
                    ..Default::default()
                },
                None,
            ));
        }
        match event {
            openai::ResponseStreamEvent::OutputTextDelta { delta, .. } => {
                if !delta.is_empty() {
                    out.push(self.chunk(
                        openai::ChatDelta {
                            content: Some(delta),
                            ..Default::default()
                        },
                        None,
                    ));
                }
            }
            openai::ResponseStreamEvent::OutputItemAdded { output_index, item } => {
                if let openai::ResponseOutputItem::FunctionCall { call_id, name, .. } = item {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indexes.insert(output_index, tool_index);
                    self.saw_tool_call = true;
                    out.push(self.chunk(
                        openai::ChatDelta {
                            tool_calls: Some(vec![openai::ToolCallChunk {
                                index: tool_index,
                                id: Some(call_id),
                                r#type: Some("function".to_string()),
                                function: Some(openai::FunctionCallChunk {
                                    name: Some(name),
                                    arguments: Some(String::new()),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                    ));
                }
            }
            openai::ResponseStreamEvent::FunctionCallArgumentsDelta {
                output_index,
                delta,
                ..
            } => {
                if let Some(tool_index) = self.tool_indexes.get(&output_index).copied() {
                    out.push(self.chunk(
                        openai::ChatDelta {
                            tool_calls: Some(vec![openai::ToolCallChunk {
                                index: tool_index,
                                id: None,
                                r#type: None,
                                function: Some(openai::FunctionCallChunk {
                                    name: None,
                                    arguments: Some(delta),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                    ));
                }
            }
            openai::ResponseStreamEvent::Completed { response } => {
                if let Some(usage) = &response.usage {
                    self.usage.merge_max(&TokenUsage::from(usage));
                }
                out.extend(self.finish());
            }
            openai::ResponseStreamEvent::Failed { .. } => {
                out.extend(self.finish());
            }
            _ => {}
        }
        out
    }

    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let finish_reason = if self.saw_tool_call { "tool_calls" } else { "stop" };
        let final_chunk = openai::ChatCompletionChunk {
            id: self.chunk_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![openai::StreamChoice {
                index: 0,
                delta: openai::ChatDelta::default(),
                finish_reason: Some(finish_reason.to_string()),
            }],
            usage: Some(openai::CompletionUsage {
                prompt_tokens: self.usage.input_tokens + self.usage.cache_read_tokens,
                completion_tokens: self.usage.output_tokens,
                total_tokens: self.usage.input_tokens
                    + self.usage.cache_read_tokens
                    + self.usage.output_tokens,
                prompt_tokens_details: Some(openai::PromptTokensDetails {
                    cached_tokens: self.usage.cache_read_tokens,
                }),
            }),
            extra: Default::default(),
        };
        vec![json_frame(&final_chunk), SseFrame::data("[DONE]")]
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: serde_json::Value) -> SseFrame {
        SseFrame::named(
            value["type"].as_str().unwrap().to_string(),
            value.to_string(),
        )
    }

    #[test]
    fn text_deltas_and_usage_flow_to_chat_chunks() {
        let mut state = State::new("gpt-5");
        let mut frames = Vec::new();
        frames.extend(state.push(&event(json!({
            "type": "response.output_text.delta", "output_index": 0, "delta": "hel"
        }))));
        frames.extend(state.push(&event(json!({
            "type": "response.output_text.delta", "output_index": 0, "delta": "lo"
        }))));
        frames.extend(state.push(&event(json!({
            "type": "response.completed",
            "response": {"id": "resp_1", "object": "response", "model": "gpt-5",
                          "status": "completed", "output": [],
                          "usage": {"input_tokens": 3, "output_tokens": 2, "total_tokens": 5}}
        }))));

        let text: String = frames
            .iter()
            .filter(|frame| !frame.is_done_marker())
            .filter_map(|frame| serde_json::from_str::<serde_json::Value>(&frame.data).ok())
            .filter_map(|v| v["choices"][0]["delta"]["content"].as_str().map(str::to_string))
            .collect();
        assert_eq!(text, "hello");
        assert!(frames.last().unwrap().is_done_marker());
        let final_chunk: serde_json::Value =
            serde_json::from_str(&frames[frames.len() - 2].data).unwrap();
        assert_eq!(final_chunk["usage"]["completion_tokens"], 2);
        assert_eq!(final_chunk["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn function_call_items_become_tool_call_chunks() {
        let mut state = State::new("m");
        let mut frames = state.push(&event(json!({
            "type": "response.output_item.added", "output_index": 1,
            "item": {"type": "function_call", "call_id": "call_1", "name": "f",
                      "arguments": ""}
        })));
        frames.extend(state.push(&event(json!({
            "type": "response.function_call_arguments.delta", "output_index": 1,
            "delta": "{\"x\":1}"
        }))));
        frames.extend(state.finish());

        let parsed: Vec<serde_json::Value> = frames
            .iter()
            .filter(|frame| !frame.is_done_marker())
            .map(|frame| serde_json::from_str(&frame.data).unwrap())
            .collect();
        let start = parsed
            .iter()
            .find(|v| v["choices"][0]["delta"]["tool_calls"][0]["id"] == "call_1")
            .unwrap();
        assert_eq!(
            start["choices"][0]["delta"]["tool_calls"][0]["function"]["name"],
            "f"
        );
        let args: String = parsed
            .iter()
            .filter_map(|v| {
                v["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"]
                    .as_str()
                    .map(str::to_string)
            })
            .collect();
        assert_eq!(args, "{\"x\":1}");
        let last = parsed.last().unwrap();
        assert_eq!(last["choices"][0]["finish_reason"], "tool_calls");
    }
}
