//! Claude message stream → Gemini generateContent stream.

use std::collections::HashMap;

use omnigate_protocol::sse::SseFrame;
use omnigate_protocol::usage::TokenUsage;
use omnigate_protocol::{claude, gemini};

use super::{claude_stop_to_gemini, json_frame};

#[derive(Default)]
struct PendingTool {
    name: String,
    arguments: String,
}

pub struct State {
    model: String,
    finished: bool,
    /// claude block index -> accumulating tool call.
    pending_tools: HashMap<usize, PendingTool>,
    usage: TokenUsage,
    finish_reason: Option<String>,
}

impl State {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            finished: false,
            pending_tools: HashMap::new(),
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
        let Ok(event) = serde_json::from_str::<claude::StreamEvent>(&frame.data) else {
            return Vec::new();
        };
        match event {
            claude::StreamEvent::MessageStart { message } => {
                self.usage.merge_max(&TokenUsage::from(&message.usage));
                Vec::new()
            }
            claude::StreamEvent::ContentBlockStart {
                index,
                content_block: claude::ContentBlock::ToolUse { name, .. },
            } => {
                self.pending_tools.insert(
                    index,
                    PendingTool {
                        name,
                        arguments: String::new(),
                    },
                );
                Vec::new()
            }
            claude::StreamEvent::ContentBlockDelta { index, delta } => match delta {
                claude::ContentDelta::TextDelta { text } => {
                    vec![self.response_with_parts(vec![gemini::Part::text(text)], None, None)]
                }
                claude::ContentDelta::ThinkingDelta { thinking } => vec![self.response_with_parts(
                    vec![gemini::Part {
                        text: Some(thinking),
                        thought: Some(true),
                        ..Default::default()
                    }],
                    None,
                    None,
                )],
                claude::ContentDelta::InputJsonDelta { partial_json } => {
                    if let Some(pending) = self.pending_tools.get_mut(&index) {
                        pending.arguments.push_str(&partial_json);
                    }
                    Vec::new()
                }
                claude::ContentDelta::SignatureDelta { .. } => Vec::new(),
            },
            claude::StreamEvent::ContentBlockStop { index } => {
                // A completed tool block flushes as a whole functionCall part.
                let Some(pending) = self.pending_tools.remove(&index) else {
                    return Vec::new();
                };
                let args = serde_json::from_str(&pending.arguments).ok();
                vec![self.response_with_parts(
                    vec![gemini::Part {
                        function_call: Some(gemini::FunctionCall {
                            name: pending.name,
                            args,
                        }),
                        ..Default::default()
                    }],
                    None,
                    None,
                )]
            }
            claude::StreamEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.usage.merge_max(&TokenUsage::from(&usage));
                }
                self.finish_reason = delta
                    .stop_reason
                    .as_deref()
                    .map(|reason| claude_stop_to_gemini(reason).to_string());
                Vec::new()
            }
            claude::StreamEvent::MessageStop => self.finish(),
            claude::StreamEvent::ContentBlockStart { .. }
            | claude::StreamEvent::Ping
            | claude::StreamEvent::Error { .. } => Vec::new(),
        }
    }

    pub fn finish(&mut self) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let usage = gemini::UsageMetadata {
            prompt_token_count: self.usage.input_tokens + self.usage.cache_read_tokens,
            candidates_token_count: self.usage.output_tokens,
            total_token_count: self.usage.input_tokens
                + self.usage.cache_read_tokens
                + self.usage.output_tokens,
            cached_content_token_count: self.usage.cache_read_tokens,
            thoughts_token_count: 0,
        };
        vec![self.response_with_parts(
            Vec::new(),
            Some(
                self.finish_reason
                    .clone()
                    .unwrap_or_else(|| "STOP".to_string()),
            ),
            Some(usage),
        )]
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }
}
