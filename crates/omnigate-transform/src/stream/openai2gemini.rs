//! OpenAI chat-completions stream → Gemini generateContent stream.
//!
//! Gemini function calls carry complete arguments, so tool-call fragments
//! accumulate here and flush as whole `functionCall` parts at end of stream.

use std::collections::BTreeMap;

use omnigate_protocol::sse::SseFrame;
use omnigate_protocol::usage::TokenUsage;
use omnigate_protocol::{gemini, openai};

use super::{json_frame, openai_finish_to_gemini};

#[derive(Default)]
struct PendingTool {
    name: String,
    arguments: String,
}

pub struct State {
    model: String,
    finished: bool,
    pending_tools: BTreeMap<i64, PendingTool>,
    usage: TokenUsage,
    finish_reason: Option<String>,
}

impl State {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            finished: false,
            pending_tools: BTreeMap::new(),
            usage: TokenUsage::default(),
            finish_reason: None,
        }
    }

    fn response_with_parts(
        &self,
        parts: Vec<gemini::Part>,
        finish_reason: Option<String>,
        usage: Option<gemini::UsageMetadata>,
    ) -> SseFrame {
        json_frame(&gemini::GenerateContentResponse {
            candidates: vec![gemini::Candidate {
                content: Some(gemini::Content::model(parts)),
                finish_reason,
                index: Some(0),
            }],
            usage_metadata: usage,
            model_version: Some(self.model.clone()),
            response_id: None,
            extra: Default::default(),
        })
    }

    pub fn push(&mut self, frame: &SseFrame) -> Vec<SseFrame> {
        if frame.is_done_marker() {
            return self.finish();
        }
        let Ok(chunk) = serde_json::from_str::<openai::ChatCompletionChunk>(&frame.data) else {
            return Vec::new();
        };
        if let Some(usage) = &chunk.usage {
            self.usage.merge_max(&TokenUsage::from(usage));
        }
        let mut out = Vec::new();
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content
                && !content.is_empty()
            {
                out.push(self.response_with_parts(
                    vec![gemini::Part::text(content.clone())],
                    None,
                    None,
                ));
            }
            if let Some(reasoning) = &choice.delta.reasoning_content
                && !reasoning.is_empty()
            {
                out.push(self.response_with_parts(
                    vec![gemini::Part {
                        text: Some(reasoning.clone()),
                        thought: Some(true),
                        ..Default::default()
                    }],
                    None,
                    None,
                ));
            }
            for tool in choice.delta.tool_calls.iter().flatten() {
                let pending = self.pending_tools.entry(tool.index).or_default();
                if let Some(function) = &tool.function {
                    if let Some(name) = &function.name {
                        pending.name = name.clone();
                    }
                    if let Some(arguments) = &function.arguments {
                        pending.arguments.push_str(arguments);
                    }
                }
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

        let mut parts: Vec<gemini::Part> = Vec::new();
        for (_, pending) in std::mem::take(&mut self.pending_tools) {
            let args = serde_json::from_str(&pending.arguments).ok();
            parts.push(gemini::Part {
                function_call: Some(gemini::FunctionCall {
                    name: pending.name,
                    args,
                }),
                ..Default::default()
            });
        }

        let finish_reason = self
            .finish_reason
            .as_deref()
            .map(openai_finish_to_gemini)
            .unwrap_or("STOP")
            .to_string();
        let usage = gemini::UsageMetadata {
            prompt_token_count: self.usage.input_tokens + self.usage.cache_read_tokens,
            candidates_token_count: self.usage.output_tokens,
            total_token_count: self.usage.input_tokens
                + self.usage.cache_read_tokens
                + self.usage.output_tokens,
            cached_content_token_count: self.usage.cache_read_tokens,
            thoughts_token_count: 0,
        };
        vec![self.response_with_parts(parts, Some(finish_reason), Some(usage))]
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(data: serde_json::Value) -> SseFrame {
        SseFrame::data(data.to_string())
    }

    #[test]
    fn text_deltas_become_candidate_parts() {
        let mut state = State::new("gemini-2.0-flash");
        let frames = state.push(&chunk(serde_json::json!({
            "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"content": "hi"}}]
        })));
        let value: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(value["candidates"][0]["content"]["parts"][0]["text"], "hi");
        assert_eq!(value["candidates"][0]["content"]["role"], "model");
    }

    #[test]
    fn tool_fragments_flush_as_complete_function_call() {
        let mut state = State::new("m");
        state.push(&chunk(serde_json::json!({
            "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "id": "call_1", "type": "function",
                "function": {"name": "f", "arguments": "{\"x\""}
            }]}}]
        })));
        state.push(&chunk(serde_json::json!({
            "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "function": {"arguments": ":1}"}
            }]}, "finish_reason": "tool_calls"}]
        })));
        let frames = state.push(&SseFrame::data("[DONE]"));
        let value: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        let call = &value["candidates"][0]["content"]["parts"][0]["functionCall"];
        assert_eq!(call["name"], "f");
        assert_eq!(call["args"]["x"], 1);
    }
}
