//! OpenAI chat-completions stream → OpenAI Responses stream.

use std::collections::HashMap;

use omnigate_protocol::openai;
use omnigate_protocol::sse::SseFrame;
use omnigate_protocol::usage::TokenUsage;

use super::response_frame;

struct ToolItem {
    output_index: i64,
    call_id: String,
    name: String,
    arguments: String,
}

pub struct State {
    response_id: String,
    model: String,
    started: bool,
    finished: bool,
    next_output_index: i64,
    text_item: Option<i64>,
    text: String,
    /// chat tool index -> responses function_call item.
    tool_items: HashMap<i64, ToolItem>,
    usage: TokenUsage,
}

impl State {
    pub fn new(model: &str) -> Self {
        Self {
            response_id: format!("resp_{}", uuid::Uuid::new_v4().simple()),
            model: model.to_string(),
            started: false,
            finished: false,
            next_output_index: 0,
            text_item: None,
            text: String::new(),
            tool_items: HashMap::new(),
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
                let output_index = self.ensure_text_item(&mut out);
                self.text.push_str(content);
                out.push(response_frame(&openai::ResponseStreamEvent::OutputTextDelta {
                    item_id: None,
                    output_index,
                    delta: content.clone(),
                }));
            }
            for tool in choice.delta.tool_calls.iter().flatten() {
                self.push_tool_chunk(tool, &mut out);
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

        let mut output: Vec<openai::ResponseOutputItem> = Vec::new();
        if let Some(output_index) = self.text_item {
            out.push(response_frame(&openai::ResponseStreamEvent::OutputTextDone {
                output_index,
                text: self.text.clone(),
            }));
            output.push(openai::ResponseOutputItem::Message {
                id: None,
                role: "assistant".to_string(),
                content: vec![openai::ResponseContentPart::OutputText {
                    text: self.text.clone(),
                }],
            });
        }
        let mut tools: Vec<&ToolItem> = self.tool_items.values().collect();
        tools.sort_by_key(|item| item.output_index);
        for item in tools {
            out.push(response_frame(
                &openai::ResponseStreamEvent::FunctionCallArgumentsDone {
                    output_index: item.output_index,
                    arguments: item.arguments.clone(),
                },
            ));
            output.push(openai::ResponseOutputItem::FunctionCall {
                id: None,
                call_id: item.call_id.clone(),
                name: item.name.clone(),
                arguments: item.arguments.clone(),
            });
        }

        out.push(response_frame(&openai::ResponseStreamEvent::Completed {
            response: openai::ResponseBody {
                id: self.response_id.clone(),
                object: "response".to_string(),
                created_at: None,
                model: self.model.clone(),
                status: "completed".to_string(),
                output,
                usage: Some(openai::ResponsesUsage {
                    input_tokens: self.usage.input_tokens + self.usage.cache_read_tokens,
                    output_tokens: self.usage.output_tokens,
                    total_tokens: self.usage.input_tokens
                        + self.usage.cache_read_tokens
                        + self.usage.output_tokens,
                    input_tokens_details: Some(openai::ResponsesInputTokensDetails {
                        cached_tokens: self.usage.cache_read_tokens,
                    }),
                }),
                extra: Default::default(),
            },
        }));
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
        out.push(response_frame(&openai::ResponseStreamEvent::Created {
            response: serde_json::json!({
                "id": self.response_id,
                "object": "response",
                "model": self.model,
                "status": "in_progress",
            }),
        }));
    }

    fn ensure_text_item(&mut self, out: &mut Vec<SseFrame>) -> i64 {
        if let Some(output_index) = self.text_item {
            return output_index;
        }
        let output_index = self.next_output_index;
        self.next_output_index += 1;
        self.text_item = Some(output_index);
        out.push(response_frame(&openai::ResponseStreamEvent::OutputItemAdded {
            output_index,
            item: openai::ResponseOutputItem::Message {
                id: None,
                role: "assistant".to_string(),
                content: Vec::new(),
            },
        }));
        output_index
    }

    fn push_tool_chunk(&mut self, tool: &openai::ToolCallChunk, out: &mut Vec<SseFrame>) {
        if !self.tool_items.contains_key(&tool.index) {
            let output_index = self.next_output_index;
            self.next_output_index += 1;
            let call_id = tool
                .id
                .clone()
                .unwrap_or_else(|| format!("call_{}", tool.index + 1));
            let name = tool
                .function
                .as_ref()
                .and_then(|function| function.name.clone())
                .unwrap_or_default();
            out.push(response_frame(&openai::ResponseStreamEvent::OutputItemAdded {
                output_index,
                item: openai::ResponseOutputItem::FunctionCall {
                    id: None,
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                },
            }));
            self.tool_items.insert(
                tool.index,
                ToolItem {
                    output_index,
                    call_id,
                    name,
                    arguments: String::new(),
                },
            );
        }
        if let Some(arguments) = tool.function.as_ref().and_then(|f| f.arguments.as_ref())
            && !arguments.is_empty()
            && let Some(item) = self.tool_items.get_mut(&tool.index)
        {
            item.arguments.push_str(arguments);
            out.push(response_frame(
                &openai::ResponseStreamEvent::FunctionCallArgumentsDelta {
                    item_id: None,
                    output_index: item.output_index,
                    delta: arguments.clone(),
                },
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(data: serde_json::Value) -> SseFrame {
        SseFrame::data(data.to_string())
    }

    #[test]
    fn text_stream_produces_response_events_without_done_marker() {
        let mut state = State::new("gpt-5");
        let mut frames = Vec::new();
        for piece in ["hel", "lo"] {
            frames.extend(state.push(&chunk(json!({
                "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-5",
                "choices": [{"index": 0, "delta": {"content": piece}}]
            }))));
        }
        frames.extend(state.push(&chunk(json!({
            "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "gpt-5",
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        }))));
        frames.extend(state.push(&SseFrame::data("[DONE]")));

        assert_eq!(frames[0].event.as_deref(), Some("response.created"));
        let text: String = frames
            .iter()
            .filter(|frame| frame.event.as_deref() == Some("response.output_text.delta"))
            .filter_map(|frame| serde_json::from_str::<serde_json::Value>(&frame.data).ok())
            .filter_map(|v| v["delta"].as_str().map(str::to_string))
            .collect();
        assert_eq!(text, "hello");
        assert!(frames.iter().all(|frame| !frame.is_done_marker()));

        let completed = frames.last().unwrap();
        assert_eq!(completed.event.as_deref(), Some("response.completed"));
        let value: serde_json::Value = serde_json::from_str(&completed.data).unwrap();
        assert_eq!(value["response"]["usage"]["input_tokens"], 3);
        assert_eq!(value["response"]["output"][0]["content"][0]["text"], "hello");
    }

    #[test]
    fn tool_fragments_accumulate_into_function_call_items() {
        let mut state = State::new("m");
        state.push(&chunk(json!({
            "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "id": "call_1", "type": "function",
                "function": {"name": "f", "arguments": "{\"x\""}
            }]}}]
        })));
        state.push(&chunk(json!({
            "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "function": {"arguments": ":1}"}
            }]}, "finish_reason": "tool_calls"}]
        })));
        let frames = state.push(&SseFrame::data("[DONE]"));
        let completed: serde_json::Value =
            serde_json::from_str(&frames.last().unwrap().data).unwrap();
        let call = &completed["response"]["output"][0];
        assert_eq!(call["type"], "function_call");
        assert_eq!(call["call_id"], "call_1");
        assert_eq!(call["arguments"], "{\"x\":1}");
    }
}
