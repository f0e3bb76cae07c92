//! Gemini generateContent stream → OpenAI chat-completions stream.

use omnigate_protocol::sse::SseFrame;
use omnigate_protocol::usage::TokenUsage;
use omnigate_protocol::{gemini, openai};

use super::{gemini_finish_to_openai, json_frame};

pub struct State {
    chunk_id: String,
    model: String,
    created: i64,
    finished: bool,
    role_sent: bool,
    next_tool_index: i64,
    usage: TokenUsage,
    finish_reason: Option<String>,
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
        let Ok(response) = serde_json::from_str::<gemini::GenerateContentResponse>(&frame.data)
        else {
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
        if let Some(usage) = &response.usage_metadata {
            self.usage.merge_max(&TokenUsage::from(usage));
        }
        for candidate in &response.candidates {
            if let Some(content) = &candidate.content {
                for part in &content.parts {
                    if let Some(text) = &part.text
                        && !text.is_empty()
                    {
                        let delta = if part.thought == Some(true) {
                            openai::ChatDelta {
                                reasoning_content: Some(text.clone()),
                                ..Default::default()
                            }
                        } else {
                            openai::ChatDelta {
                                content: Some(text.clone()),
                                ..Default::default()
                            }
                        };
                        out.push(self.chunk(delta, None));
                    }
                    if let Some(call) = &part.function_call {
                        let tool_index = self.next_tool_index;
                        self.next_tool_index += 1;
                        self.finish_reason = Some("tool_calls".to_string());
                        out.push(self.chunk(
                            openai::ChatDelta {
                                tool_calls: Some(vec![openai::ToolCallChunk {
                                    index: tool_index,
                                    id: Some(format!("call_{}", tool_index + 1)),
                                    r#type: Some("function".to_string()),
                                    function: Some(openai::FunctionCallChunk {
                                        name: Some(call.name.clone()),
                                        arguments: Some(
                                            call.args
                                                .as_ref()
                                                .map(|args| args.to_string())
                                                .unwrap_or_else(|| "{}".to_string()),
                                        ),
                                    }),
                                }]),
                                ..Default::default()
                            },
                            None,
                        ));
                    }
                }
            }
            if let Some(reason) = &candidate.finish_reason
                && self.finish_reason.is_none()
            {
                self.finish_reason = Some(gemini_finish_to_openai(reason).to_string());
            }
        }
        out
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_and_finish_flow_through() {
        let mut state = State::new("gemini-2.0-flash");
        let mut frames = state.push(&SseFrame::data(
            serde_json::json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": "hello"}]},
                                 "index": 0}]
            })
            .to_string(),
        ));
        frames.extend(state.push(&SseFrame::data(
            serde_json::json!({
                "candidates": [{"content": {"role": "model", "parts": [{"text": " world"}]},
                                 "finishReason": "STOP", "index": 0}],
                "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 2,
                                   "totalTokenCount": 6}
            })
            .to_string(),
        )));
        frames.extend(state.finish());

        let text: String = frames
            .iter()
            .filter_map(|frame| serde_json::from_str::<serde_json::Value>(&frame.data).ok())
            .filter_map(|v| v["choices"][0]["delta"]["content"].as_str().map(str::to_string))
            .collect();
        assert_eq!(text, "hello world");
        assert!(frames.last().unwrap().is_done_marker());
        assert_eq!(state.usage().output_tokens, 2);
    }

    #[test]
    fn function_call_sets_tool_finish_reason() {
        let mut state = State::new("m");
        state.push(&SseFrame::data(
            serde_json::json!({
                "candidates": [{"content": {"role": "model", "parts": [
                    {"functionCall": {"name": "f", "args": {"x": 1}}}
                ]}, "index": 0}]
            })
            .to_string(),
        ));
        let frames = state.finish();
        let final_chunk: serde_json::Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(final_chunk["choices"][0]["finish_reason"], "tool_calls");
    }
}
