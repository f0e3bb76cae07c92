//! Stream-to-non-stream aggregation: collapse a full SSE stream into the
//! family's single response body. Used when the client posted
//! `stream: false` against an upstream that only streams.

use omnigate_common::{ApiFamily, EndpointKind, EndpointSignature};
use omnigate_protocol::sse::SseFrame;
use omnigate_protocol::usage::TokenUsage;
use omnigate_protocol::{claude, gemini, openai};
use serde_json::Value;

pub struct StreamAggregator {
    signature: EndpointSignature,
    model: String,
    text: String,
    reasoning: String,
    tool_calls: Vec<openai::ToolCall>,
    /// claude/gemini tool assembly: (name, argument fragments) keyed by index.
    pending_tools: std::collections::BTreeMap<i64, (String, String)>,
    finish_reason: Option<String>,
    usage: TokenUsage,
}

impl StreamAggregator {
    pub fn new(signature: EndpointSignature, model: &str) -> Self {
        Self {
            signature,
            model: model.to_string(),
            text: String::new(),
            reasoning: String::new(),
            tool_calls: Vec::new(),
            pending_tools: std::collections::BTreeMap::new(),
            finish_reason: None,
            usage: TokenUsage::default(),
        }
    }

    fn is_openai_responses(&self) -> bool {
        self.signature.family == ApiFamily::OpenAI && self.signature.kind == EndpointKind::Cli
    }

    pub fn push(&mut self, frame: &SseFrame) {
        if frame.is_done_marker() {
            return;
        }
        match self.signature.family {
            ApiFamily::OpenAI if self.is_openai_responses() => self.push_openai_responses(frame),
            ApiFamily::OpenAI => self.push_openai(frame),
            ApiFamily::Claude => self.push_claude(frame),
            ApiFamily::Gemini => self.push_gemini(frame),
        }
    }

    fn push_openai_responses(&mut self, frame: &SseFrame) {
        let Ok(event) = serde_json::from_str::<openai::ResponseStreamEvent>(&frame.data) else {
            return;
        };
        match event {
            openai::ResponseStreamEvent::OutputTextDelta { delta, .. } => {
                self.text.push_str(&delta);
            }
            openai::ResponseStreamEvent::OutputItemAdded { output_index, item } => {
                if let openai::ResponseOutputItem::FunctionCall { name, .. } = item {
                    self.pending_tools.insert(output_index, (name, String::new()));
                    self.finish_reason = Some("tool_calls".to_string());
                }
            }
            openai::ResponseStreamEvent::FunctionCallArgumentsDelta {
                output_index,
                delta,
                ..
            } => {
                if let Some(entry) = self.pending_tools.get_mut(&output_index) {
                    entry.1.push_str(&delta);
                }
            }
            openai::ResponseStreamEvent::Completed { response } => {
                if let Some(usage) = &response.usage {
                    self.usage.merge_max(&TokenUsage::from(usage));
                }
                if self.finish_reason.is_none() {
                    self.finish_reason = Some("completed".to_string());
                }
            }
            _ => {}
        }
    }

    fn push_openai(&mut self, frame: &SseFrame) {
        let Ok(chunk) = serde_json::from_str::<openai::ChatCompletionChunk>(&frame.data) else {
            return;
        };
        if let Some(usage) = &chunk.usage {
            self.usage.merge_max(&TokenUsage::from(usage));
        }
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                self.text.push_str(content);
            }
            if let Some(reasoning) = &choice.delta.reasoning_content {
                self.reasoning.push_str(reasoning);
            }
            for tool in choice.delta.tool_calls.iter().flatten() {
                let entry = self
                    .pending_tools
                    .entry(tool.index)
                    .or_insert_with(|| (String::new(), String::new()));
                if let Some(function) = &tool.function {
                    if let Some(name) = &function.name {
                        entry.0 = name.clone();
                    }
                    if let Some(arguments) = &function.arguments {
                        entry.1.push_str(arguments);
                    }
                }
            }
            if let Some(reason) = &choice.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
    }

    fn push_claude(&mut self, frame: &SseFrame) {
        let Ok(event) = serde_json::from_str::<claude::StreamEvent>(&frame.data) else {
            return;
        };
        match event {
            claude::StreamEvent::MessageStart { message } => {
                self.usage.merge_max(&TokenUsage::from(&message.usage));
            }
            claude::StreamEvent::ContentBlockStart {
                index,
                content_block: claude::ContentBlock::ToolUse { name, .. },
            } => {
                self.pending_tools
                    .insert(index as i64, (name, String::new()));
            }
            claude::StreamEvent::ContentBlockDelta { index, delta } => match delta {
                claude::ContentDelta::TextDelta { text } => self.text.push_str(&text),
                claude::ContentDelta::ThinkingDelta { thinking } => {
                    self.reasoning.push_str(&thinking);
                }
                claude::ContentDelta::InputJsonDelta { partial_json } => {
                    if let Some(entry) = self.pending_tools.get_mut(&(index as i64)) {
                        entry.1.push_str(&partial_json);
                    }
                }
                claude::ContentDelta::SignatureDelta { .. } => {}
            },
            claude::StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.usage.merge_max(&TokenUsage::from(&usage));
                }
                if let Some(reason) = delta.stop_reason {
                    self.finish_reason = Some(reason);
                }
            }
            _ => {}
        }
    }

    fn push_gemini(&mut self, frame: &SseFrame) {
        let Ok(response) = serde_json::from_str::<gemini::GenerateContentResponse>(&frame.data)
        else {
            return;
        };
        if let Some(usage) = &response.usage_metadata {
            self.usage.merge_max(&TokenUsage::from(usage));
        }
        for candidate in &response.candidates {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = &part.text {
                        if part.thought == Some(true) {
                            self.reasoning.push_str(text);
                        } else {
                            self.text.push_str(text);
                        }
                    }
                    if let Some(call) = &part.function_call {
                        let index = self.pending_tools.len() as i64;
                        self.pending_tools.insert(
                            index,
                            (
                                call.name.clone(),
                                call.args
                                    .as_ref()
                                    .map(|args| args.to_string())
                                    .unwrap_or_else(|| "{}".to_string()),
                            ),
                        );
                    }
                }
            }
            if let Some(reason) = &candidate.finish_reason {
                self.finish_reason = Some(reason.clone());
            }
        }
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    /// Emit the aggregated non-stream body in the client signature's shape.
    pub fn into_body(mut self) -> Value {
        for (position, (name, arguments)) in std::mem::take(&mut self.pending_tools) {
            self.tool_calls.push(openai::ToolCall {
                id: format!("call_{}", position + 1),
                r#type: "function".to_string(),
                function: openai::FunctionCall { name, arguments },
            });
        }
        match self.signature.family {
            ApiFamily::OpenAI if self.is_openai_responses() => self.openai_responses_body(),
            ApiFamily::OpenAI => self.openai_body(),
            ApiFamily::Claude => self.claude_body(),
            ApiFamily::Gemini => self.gemini_body(),
        }
    }

    fn openai_responses_body(self) -> Value {
        let mut output: Vec<Value> = Vec::new();
        if !self.text.is_empty() {
            output.push(serde_json::json!({
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": self.text}],
            }));
        }
        for call in &self.tool_calls {
            output.push(serde_json::json!({
                "type": "function_call",
                "call_id": call.id,
                "name": call.function.name,
                "arguments": call.function.arguments,
            }));
        }
        serde_json::json!({
            "id": format!("resp_{}", uuid::Uuid::new_v4().simple()),
            "object": "response",
            "model": self.model,
            "status": "completed",
            "output": output,
            "usage": {
                "input_tokens": self.usage.input_tokens + self.usage.cache_read_tokens,
                "output_tokens": self.usage.output_tokens,
                "total_tokens": self.usage.input_tokens + self.usage.cache_read_tokens
                    + self.usage.output_tokens,
            },
        })
    }

    fn openai_body(self) -> Value {
        serde_json::json!({
            "id": format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            "object": "chat.completion",
            "created": std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|elapsed| elapsed.as_secs())
                .unwrap_or(0),
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": if self.text.is_empty() { Value::Null } else { Value::String(self.text) },
                    "tool_calls": if self.tool_calls.is_empty() {
                        Value::Null
                    } else {
                        serde_json::to_value(&self.tool_calls).unwrap_or(Value::Null)
                    },
                },
                "finish_reason": self.finish_reason.unwrap_or_else(|| "stop".to_string()),
            }],
            "usage": {
                "prompt_tokens": self.usage.input_tokens + self.usage.cache_read_tokens,
                "completion_tokens": self.usage.output_tokens,
                "total_tokens": self.usage.input_tokens + self.usage.cache_read_tokens
                    + self.usage.output_tokens,
            },
        })
    }

    fn claude_body(self) -> Value {
        let mut content: Vec<Value> = Vec::new();
        if !self.reasoning.is_empty() {
            content.push(serde_json::json!({"type": "thinking", "thinking": self.reasoning}));
        }
        if !self.text.is_empty() {
            content.push(serde_json::json!({"type": "text", "text": self.text}));
        }
        for call in &self.tool_calls {
            content.push(serde_json::json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.function.name,
                "input": serde_json::from_str::<Value>(&call.function.arguments)
                    .unwrap_or_else(|_| serde_json::json!({})),
            }));
        }
        serde_json::json!({
            "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
            "type": "message",
            "role": "assistant",
            "model": self.model,
            "content": content,
            "stop_reason": self.finish_reason.unwrap_or_else(|| "end_turn".to_string()),
            "usage": {
                "input_tokens": self.usage.input_tokens,
                "output_tokens": self.usage.output_tokens,
                "cache_read_input_tokens": self.usage.cache_read_tokens,
            },
        })
    }

    fn gemini_body(self) -> Value {
        let mut parts: Vec<Value> = Vec::new();
        if !self.text.is_empty() {
            parts.push(serde_json::json!({"text": self.text}));
        }
        for call in &self.tool_calls {
            parts.push(serde_json::json!({
                "functionCall": {
                    "name": call.function.name,
                    "args": serde_json::from_str::<Value>(&call.function.arguments)
                        .unwrap_or_else(|_| serde_json::json!({})),
                }
            }));
        }
        serde_json::json!({
            "candidates": [{
                "content": {"role": "model", "parts": parts},
                "finishReason": self.finish_reason.unwrap_or_else(|| "STOP".to_string()),
                "index": 0,
            }],
            "usageMetadata": {
                "promptTokenCount": self.usage.input_tokens + self.usage.cache_read_tokens,
                "candidatesTokenCount": self.usage.output_tokens,
                "totalTokenCount": self.usage.input_tokens + self.usage.cache_read_tokens
                    + self.usage.output_tokens,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(family: ApiFamily) -> EndpointSignature {
        EndpointSignature::new(family, EndpointKind::Chat)
    }

    #[test]
    fn openai_stream_collapses_to_completion() {
        let mut aggregator = StreamAggregator::new(chat(ApiFamily::OpenAI), "gpt-4o");
        for piece in ["he", "llo"] {
            aggregator.push(&SseFrame::data(
                serde_json::json!({
                    "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
                    "choices": [{"index": 0, "delta": {"content": piece}}]
                })
                .to_string(),
            ));
        }
        aggregator.push(&SseFrame::data(
            serde_json::json!({
                "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-4o",
                "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 2, "completion_tokens": 2, "total_tokens": 4}
            })
            .to_string(),
        ));
        aggregator.push(&SseFrame::data("[DONE]"));

        let body = aggregator.into_body();
        assert_eq!(body["choices"][0]["message"]["content"], "hello");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(body["usage"]["completion_tokens"], 2);
    }

    #[test]
    fn responses_stream_collapses_to_a_response_body() {
        let signature = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Cli);
        let mut aggregator = StreamAggregator::new(signature, "gpt-5");
        aggregator.push(&SseFrame::named(
            "response.output_text.delta",
            serde_json::json!({
                "type": "response.output_text.delta", "output_index": 0, "delta": "hi"
            })
            .to_string(),
        ));
        aggregator.push(&SseFrame::named(
            "response.completed",
            serde_json::json!({
                "type": "response.completed",
                "response": {"id": "r", "object": "response", "model": "gpt-5",
                              "status": "completed", "output": [],
                              "usage": {"input_tokens": 2, "output_tokens": 1,
                                         "total_tokens": 3}}
            })
            .to_string(),
        ));
        assert_eq!(aggregator.usage().output_tokens, 1);
        let body = aggregator.into_body();
        assert_eq!(body["object"], "response");
        assert_eq!(body["output"][0]["content"][0]["text"], "hi");
        assert_eq!(body["usage"]["input_tokens"], 2);
    }

    #[test]
    fn claude_stream_collapses_with_tool_use() {
        let mut aggregator = StreamAggregator::new(chat(ApiFamily::Claude), "m");
        aggregator.push(&SseFrame::named(
            "content_block_start",
            serde_json::json!({
                "type": "content_block_start", "index": 0,
                "content_block": {"type": "tool_use", "id": "t", "name": "f", "input": {}}
            })
            .to_string(),
        ));
        aggregator.push(&SseFrame::named(
            "content_block_delta",
            serde_json::json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "input_json_delta", "partial_json": "{\"a\":1}"}
            })
            .to_string(),
        ));
        let body = aggregator.into_body();
        assert_eq!(body["content"][0]["type"], "tool_use");
        assert_eq!(body["content"][0]["input"]["a"], 1);
    }
}
