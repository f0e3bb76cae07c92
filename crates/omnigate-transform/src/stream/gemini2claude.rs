//! Gemini generateContent stream → Claude message stream.

use omnigate_protocol::sse::SseFrame;
use omnigate_protocol::usage::TokenUsage;
use omnigate_protocol::{claude, gemini};

use super::{claude_frame, claude_message_skeleton, gemini_finish_to_claude};

enum OpenBlock {
    None,
    Text(usize),
    Thinking(usize),
}

pub struct State {
    model: String,
    message_id: String,
    started: bool,
    finished: bool,
    next_block_index: usize,
    open_block: OpenBlock,
    usage: TokenUsage,
    finish_reason: Option<String>,
    saw_tool_call: bool,
}

impl State {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            started: false,
            finished: false,
            next_block_index: 0,
            open_block: OpenBlock::None,
            usage: TokenUsage::default(),
            finish_reason: None,
            saw_tool_call: false,
        }
    }

    pub fn push(&mut self, frame: &SseFrame) -> Vec<SseFrame> {
        let Ok(response) = serde_json::from_str::<gemini::GenerateContentResponse>(&frame.data)
        else {
            return Vec::new();
        };
        let mut out = Vec::new();
        self.ensure_started(&mut out);

        if let Some(usage) = &response.usage_metadata {
            self.usage.merge_max(&TokenUsage::from(usage));
        }

        for candidate in &response.candidates {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    self.push_part(part, &mut out);
                }
            }
            if let Some(reason) = &candidate.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
        out
    }

    fn push_part(&mut self, part: &gemini::Part, out: &mut Vec<SseFrame>) {
        if let Some(text) = &part.text
            && !text.is_empty()
        {
            if part.thought == Some(true) {
                let index = self.ensure_thinking_block(out);
                out.push(claude_frame(&claude::StreamEvent::ContentBlockDelta {
                    index,
                    delta: claude::ContentDelta::ThinkingDelta {
                        thinking: text.clone(),
                    },
                }));
                if let Some(signature) = &part.thought_signature {
                    out.push(claude_frame(&claude::StreamEvent::ContentBlockDelta {
                        index,
                        delta: claude::ContentDelta::SignatureDelta {
                            signature: signature.clone(),
                        },
                    }));
                }
            } else {
                let index = self.ensure_text_block(out);
                out.push(claude_frame(&claude::StreamEvent::ContentBlockDelta {
                    index,
                    delta: claude::ContentDelta::TextDelta { text: text.clone() },
                }));
            }
        }
        if let Some(call) = &part.function_call {
            self.close_open_block(out);
            self.saw_tool_call = true;
            let index = self.next_block_index;
            self.next_block_index += 1;
            let input = call.args.clone().unwrap_or_else(|| serde_json::json!({}));
            out.push(claude_frame(&claude::StreamEvent::ContentBlockStart {
                index,
                content_block: claude::ContentBlock::ToolUse {
                    id: format!("toolu_{}", index + 1),
                    name: call.name.clone(),
                    input: serde_json::json!({}),
                    cache_control: None,
                },
            }));
            out.push(claude_frame(&claude::StreamEvent::ContentBlockDelta {
                index,
                delta: claude::ContentDelta::InputJsonDelta {
                    partial_json: input.to_string(),
                },
            }));
            out.push(claude_frame(&claude::StreamEvent::ContentBlockStop { index }));
        }
    }

    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        self.close_open_block(&mut out);

        let stop_reason = if self.saw_tool_call {
            "tool_use".to_string()
        } else {
            self.finish_reason
                .as_deref()
                .map(gemini_finish_to_claude)
                .unwrap_or("end_turn")
                .to_string()
        };
        out.push(claude_frame(&claude::StreamEvent::MessageDelta {
            delta: claude::MessageDeltaBody {
                stop_reason: Some(stop_reason),
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
        if let OpenBlock::Text(index) = self.open_block {
            return index;
        }
        self.close_open_block(out);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = OpenBlock::Text(index);
        out.push(claude_frame(&claude::StreamEvent::ContentBlockStart {
            index,
            content_block: claude::ContentBlock::text(""),
        }));
        index
    }

    fn ensure_thinking_block(&mut self, out: &mut Vec<SseFrame>) -> usize {
        if let OpenBlock::Thinking(index) = self.open_block {
            return index;
        }
        self.close_open_block(out);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = OpenBlock::Thinking(index);
        out.push(claude_frame(&claude::StreamEvent::ContentBlockStart {
            index,
            content_block: claude::ContentBlock::Thinking {
                thinking: String::new(),
                signature: None,
            },
        }));
        index
    }

    fn close_open_block(&mut self, out: &mut Vec<SseFrame>) {
        match std::mem::replace(&mut self.open_block, OpenBlock::None) {
            OpenBlock::None => {}
            OpenBlock::Text(index) | OpenBlock::Thinking(index) => {
                out.push(claude_frame(&claude::StreamEvent::ContentBlockStop { index }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(value: serde_json::Value) -> SseFrame {
        SseFrame::data(value.to_string())
    }

    #[test]
    fn thought_parts_open_a_thinking_block() {
        let mut state = State::new("m");
        let mut frames = state.push(&chunk(serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [
                {"text": "pondering", "thought": true},
                {"text": "answer"}
            ]}, "index": 0}]
        })));
        frames.extend(state.finish());

        let parsed: Vec<serde_json::Value> = frames
            .iter()
            .map(|frame| serde_json::from_str(&frame.data).unwrap())
            .collect();
        let starts: Vec<&str> = parsed
            .iter()
            .filter(|v| v["type"] == "content_block_start")
            .map(|v| v["content_block"]["type"].as_str().unwrap())
            .collect();
        assert_eq!(starts, vec!["thinking", "text"]);
    }

    #[test]
    fn function_call_emits_complete_tool_block() {
        let mut state = State::new("m");
        let mut frames = state.push(&chunk(serde_json::json!({
            "candidates": [{"content": {"role": "model", "parts": [
                {"functionCall": {"name": "f", "args": {"q": "x"}}}
            ]}, "finishReason": "STOP", "index": 0}]
        })));
        frames.extend(state.finish());
        let parsed: Vec<serde_json::Value> = frames
            .iter()
            .map(|frame| serde_json::from_str(&frame.data).unwrap())
            .collect();
        let args: String = parsed
            .iter()
            .filter(|v| v["type"] == "content_block_delta")
            .filter_map(|v| v["delta"]["partial_json"].as_str())
            .collect();
        assert_eq!(args, "{\"q\":\"x\"}");
        let delta = parsed.iter().find(|v| v["type"] == "message_delta").unwrap();
        assert_eq!(delta["delta"]["stop_reason"], "tool_use");
    }
}
