//! OpenAI chat-completions stream → Claude message stream.

use std::collections::HashMap;

use omnigate_protocol::sse::SseFrame;
use omnigate_protocol::usage::TokenUsage;
use omnigate_protocol::{claude, openai};

use super::{claude_frame, claude_message_skeleton, openai_finish_to_claude};

pub struct State {
    model: String,
    message_id: String,
    started: bool,
    finished: bool,
    next_block_index: usize,
    open_text_block: Option<usize>,
    /// openai tool index -> claude block index.
    open_tool_blocks: HashMap<i64, usize>,
    finish_reason: Option<String>,
    usage: TokenUsage,
}

impl State {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            finished: false,
            next_block_index: 0,
            open_text_block: None,
            open_tool_blocks: HashMap::new(),
            finish_reason: None,
            usage: TokenUsage::default(),
        }
    }

    pub fn push(&mut self, frame: &SseFrame) -> Vec<SseFrame> {
        if frame.is_done_marker() {
            return self.finish();
        }
        let Ok(chunk) = serde_json::from_str::<openai::ChatCompletionChunk>(&frame.data) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        self.ensure_started(&mut out);

        if let Some(usage) = &chunk.usage {
            self.usage.merge_max(&TokenUsage::from(usage));
        }

        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content
                && !content.is_empty()
            {
                let index = self.ensure_text_block(&mut out);
                out.push(claude_frame(&claude::StreamEvent::ContentBlockDelta {
                    index,
                    delta: claude::ContentDelta::TextDelta {
                        text: content.clone(),
                    },
                }));
            }
            if let Some(reasoning) = &choice.delta.reasoning_content
                && !reasoning.is_empty()
            {
                let index = self.ensure_text_block(&mut out);
                out.push(claude_frame(&claude::StreamEvent::ContentBlockDelta {
                    index,
                    delta: claude::ContentDelta::ThinkingDelta {
                        thinking: reasoning.clone(),
                    },
                }));
            }
            for tool in choice.delta.tool_calls.iter().flatten() {
                self.push_tool_chunk(tool, &mut out);
            }
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
        out
    }

    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_open_blocks(&mut out);

        let stop_reason = self
            .finish_reason
            .as_deref()
            .map(openai_finish_to_claude)
            .unwrap_or("end_turn");
        out.push(claude_frame(&claude::StreamEvent::MessageDelta {
            delta: claude::MessageDeltaBody {
                stop_reason: Some(stop_reason.to_string()),
                stop_sequence: None,
            },
            usage: Some(claude::Usage {
                input_tokens: self.usage.input_tokens,
                output_tokens: self.usage.output_tokens,
                cache_read_input_tokens: self.usage.cache_read_tokens,
                ..Default::default()
            }),
        }));
        out.push(claude_frame(&claude::StreamEvent::MessageStop));
        out
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    fn ensure_started(&mut self, out: &mut Vec<SseFrame>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(claude_frame(&claude::StreamEvent::MessageStart {
            message: claude_message_skeleton(&self.message_id, &self.model),
        }));
    }

    fn ensure_text_block(&mut self, out: &mut Vec<SseFrame>) -> usize {
        if let Some(index) = self.open_text_block {
            return index;
        }
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_text_block = Some(index);
        out.push(claude_frame(&claude::StreamEvent::ContentBlockStart {
            index,
            content_block: claude::ContentBlock::text(""),
        }));
        index
    }

    fn push_tool_chunk(&mut self, tool: &openai::ToolCallChunk, out: &mut Vec<SseFrame>) {
        let block_index = match self.open_tool_blocks.get(&tool.index) {
            Some(index) => *index,
            None => {
                // Text interleaves before tool calls; close the text block.
                if let Some(text_index) = self.open_text_block.take() {
                    out.push(claude_frame(&claude::StreamEvent::ContentBlockStop {
                        index: text_index,
                    }));
                }
                let index = self.next_block_index;
                self.next_block_index += 1;
                self.open_tool_blocks.insert(tool.index, index);
                out.push(claude_frame(&claude::StreamEvent::ContentBlockStart {
                    index,
                    content_block: claude::ContentBlock::ToolUse {
                        id: tool
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("toolu_{}", tool.index)),
                        name: tool
                            .function
                            .as_ref()
                            .and_then(|f| f.name.clone())
                            .unwrap_or_default(),
                        input: serde_json::json!({}),
                        cache_control: None,
                    },
                }));
                index
            }
        };
        if let Some(arguments) = tool.function.as_ref().and_then(|f| f.arguments.as_ref())
            && !arguments.is_empty()
        {
            out.push(claude_frame(&claude::StreamEvent::ContentBlockDelta {
                index: block_index,
                delta: claude::ContentDelta::InputJsonDelta {
                    partial_json: arguments.clone(),
                },
            }));
        }
    }

    fn close_open_blocks(&mut self, out: &mut Vec<SseFrame>) {
        if let Some(index) = self.open_text_block.take() {
            out.push(claude_frame(&claude::StreamEvent::ContentBlockStop { index }));
        }
        let mut tool_indexes: Vec<usize> = self.open_tool_blocks.drain().map(|(_, v)| v).collect();
        tool_indexes.sort_unstable();
        for index in tool_indexes {
            out.push(claude_frame(&claude::StreamEvent::ContentBlockStop { index }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: serde_json::Value) -> SseFrame {
        SseFrame::data(data.to_string())
    }

    fn collect_text(frames: &[SseFrame]) -> String {
        frames
            .iter()
            .filter_map(|frame| serde_json::from_str::<serde_json::Value>(&frame.data).ok())
            .filter(|value| value["type"] == "content_block_delta")
            .filter_map(|value| value["delta"]["text"].as_str().map(str::to_string))
            .collect()
    }

    #[test]
    fn text_deltas_round_trip() {
        let mut state = State::new("gpt-4o");
        let mut frames = Vec::new();
        for piece in ["Hel", "lo ", "world"] {
            frames.extend(state.push(&chunk(serde_json::json!({
                "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
                "choices": [{"index": 0, "delta": {"content": piece}}]
            }))));
        }
        frames.extend(state.push(&SseFrame::data("[DONE]")));

        assert_eq!(collect_text(&frames), "Hello world");
        let first: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(first["type"], "message_start");
        let last: serde_json::Value = serde_json::from_str(&frames.last().unwrap().data).unwrap();
        assert_eq!(last["type"], "message_stop");
    }

    #[test]
    fn tool_call_arguments_assemble_into_input_json_deltas() {
        let mut state = State::new("m");
        let mut frames = state.push(&chunk(serde_json::json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "id": "call_1", "type": "function",
                "function": {"name": "get_weather", "arguments": "{\"ci"}
            }]}}]
        })));
        frames.extend(state.push(&chunk(serde_json::json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "function": {"arguments": "ty\":\"SF\"}"}
            }]}, "finish_reason": "tool_calls"}]
        }))));
        frames.extend(state.push(&SseFrame::data("[DONE]")));

        let parsed: Vec<serde_json::Value> = frames
            .iter()
            .map(|frame| serde_json::from_str(&frame.data).unwrap())
            .collect();
        let start = parsed
            .iter()
            .find(|value| value["type"] == "content_block_start")
            .unwrap();
        assert_eq!(start["content_block"]["name"], "get_weather");
        let args: String = parsed
            .iter()
            .filter(|value| value["type"] == "content_block_delta")
            .filter_map(|value| value["delta"]["partial_json"].as_str())
            .collect();
        assert_eq!(args, "{\"city\":\"SF\"}");
        let delta = parsed
            .iter()
            .find(|value| value["type"] == "message_delta")
            .unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn usage_is_captured_from_terminal_chunk() {
        let mut state = State::new("m");
        state.push(&chunk(serde_json::json!({
            "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [], "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
        })));
        assert_eq!(state.usage().input_tokens, 7);
        assert_eq!(state.usage().output_tokens, 3);
    }
}
