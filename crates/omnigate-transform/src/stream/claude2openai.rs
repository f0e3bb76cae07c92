//! Claude message stream → OpenAI chat-completions stream.

use std::collections::HashMap;

use omnigate_protocol::sse::SseFrame;
use omnigate_protocol::usage::TokenUsage;
use omnigate_protocol::{claude, openai};

use super::{claude_stop_to_openai, json_frame};

pub struct State {
    chunk_id: String,
    model: String,
    created: i64,
    finished: bool,
    /// claude block index -> openai tool index.
    tool_indexes: HashMap<usize, i64>,
    next_tool_index: i64,
    usage: TokenUsage,
    finish_reason: Option<String>,
}

impl State {
    pub fn new(model: &str) -> Self {
        Self {
            chunk_id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            created: time_now_unix(),
            finished: false,
            tool_indexes: HashMap::new(),
            next_tool_index: 0,
            usage: TokenUsage::default(),
            finish_reason: None,
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
        let Ok(event) = serde_json::from_str::<claude::StreamEvent>(&frame.data) else {
            return Vec::new();
        };
        match event {
            claude::StreamEvent::MessageStart { message } => {
                self.usage.merge_max(&TokenUsage::from(&message.usage));
                vec![self.chunk(
                    openai::ChatDelta {
                        role: Some(openai::ChatRole::Assistant),
                        ..Default::default()
                    },
                    None,
                )]
            }
            claude::StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                claude::ContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.next_tool_index;
                    self.next_tool_index += 1;
                    self.tool_indexes.insert(index, tool_index);
                    vec![self.chunk(
                        openai::ChatDelta {
                            tool_calls: Some(vec![openai::ToolCallChunk {
                                index: tool_index,
                                id: Some(id),
                                r#type: Some("function".to_string()),
                                function: Some(openai::FunctionCallChunk {
                                    name: Some(name),
                                    arguments: Some(String::new()),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                    )]
                }
                _ => Vec::new(),
            },
            claude::StreamEvent::ContentBlockDelta { index, delta } => match delta {
                claude::ContentDelta::TextDelta { text } => vec![self.chunk(
                    openai::ChatDelta {
                        content: Some(text),
                        ..Default::default()
                    },
                    None,
                )],
                claude::ContentDelta::ThinkingDelta { thinking } => vec![self.chunk(
                    openai::ChatDelta {
                        reasoning_content: Some(thinking),
                        ..Default::default()
                    },
                    None,
                )],
                claude::ContentDelta::InputJsonDelta { partial_json } => {
                    let Some(tool_index) = self.tool_indexes.get(&index).copied() else {
                        return Vec::new();
                    };
                    vec![self.chunk(
                        openai::ChatDelta {
                            tool_calls: Some(vec![openai::ToolCallChunk {
                                index: tool_index,
                                id: None,
                                r#type: None,
                                function: Some(openai::FunctionCallChunk {
                                    name: None,
                                    arguments: Some(partial_json),
                                }),
                            }]),
                            ..Default::default()
                        },
                        None,
                    )]
                }
                claude::ContentDelta::SignatureDelta { .. } => Vec::new(),
            },
            claude::StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.usage.merge_max(&TokenUsage::from(&usage));
                }
                self.finish_reason = delta
                    .stop_reason
                    .as_deref()
                    .map(|reason| claude_stop_to_openai(reason).to_string());
                Vec::new()
            }
            claude::StreamEvent::MessageStop => self.finish(),
            claude::StreamEvent::ContentBlockStop { .. }
            | claude::StreamEvent::Ping
            | claude::StreamEvent::Error { .. } => Vec::new(),
        }
    }

    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let final_chunk = openai::ChatCompletionChunk {
            id: self.chunk_id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![openai::StreamChoice {
                index: 0,
                delta: openai::ChatDelta::default(),
                finish_reason: Some(
                    self.finish_reason
                        .clone()
                        .unwrap_or_else(|| "stop".to_string()),
                ),
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

fn time_now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(value: serde_json::Value) -> SseFrame {
        SseFrame::named(
            value["type"].as_str().unwrap().to_string(),
            value.to_string(),
        )
    }

    #[test]
    fn message_flow_produces_openai_chunks_and_done() {
        let mut state = State::new("claude-sonnet-4");
        let mut frames = Vec::new();
        frames.extend(state.push(&event(serde_json::json!({
            "type": "message_start",
            "message": {"id": "msg_1", "type": "message", "role": "assistant",
                        "model": "claude-sonnet-4", "content": [],
                        "usage": {"input_tokens": 9, "output_tokens": 0}}
        }))));
        frames.extend(state.push(&event(serde_json::json!({
            "type": "content_block_start", "index": 0,
            "content_block": {"type": "text", "text": ""}
        }))));
        frames.extend(state.push(&event(serde_json::json!({
            "type": "content_block_delta", "index": 0,
            "delta": {"type": "text_delta", "text": "hi there"}
        }))));
        frames.extend(state.push(&event(serde_json::json!({
            "type": "message_delta", "delta": {"stop_reason": "end_turn"},
            "usage": {"input_tokens": 9, "output_tokens": 2}
        }))));
        frames.extend(state.push(&event(serde_json::json!({"type": "message_stop"}))));

        let role_chunk: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(role_chunk["choices"][0]["delta"]["role"], "assistant");
        let text: String = frames
            .iter()
            .filter_map(|frame| serde_json::from_str::<serde_json::Value>(&frame.data).ok())
            .filter_map(|v| v["choices"][0]["delta"]["content"].as_str().map(str::to_string))
            .collect();
        assert_eq!(text, "hi there");
        let final_chunk: serde_json::Value =
            serde_json::from_str(&frames[frames.len() - 2].data).unwrap();
        assert_eq!(final_chunk["choices"][0]["finish_reason"], "stop");
        assert_eq!(final_chunk["usage"]["completion_tokens"], 2);
        assert!(frames.last().unwrap().is_done_marker());
    }

    #[test]
    fn tool_use_maps_to_tool_call_chunks() {
        let mut state = State::new("m");
        let start = state.push(&event(serde_json::json!({
            "type": "content_block_start", "index": 1,
            "content_block": {"type": "tool_use", "id": "toolu_1", "name": "f", "input": {}}
        })));
        let start_value: serde_json::Value = serde_json::from_str(&start[0].data).unwrap();
        let call = &start_value["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(call["id"], "toolu_1");
        assert_eq!(call["function"]["name"], "f");

        let delta = state.push(&event(serde_json::json!({
            "type": "content_block_delta", "index": 1,
            "delta": {"type": "input_json_delta", "partial_json": "{\"x\":1}"}
        })));
        let delta_value: serde_json::Value = serde_json::from_str(&delta[0].data).unwrap();
        assert_eq!(
            delta_value["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
            "{\"x\":1}"
        );
    }
}
