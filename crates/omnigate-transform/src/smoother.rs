//! Output smoother: splits one large text delta into several small SSE
//! events with a millisecond-level delay between them, producing a
//! typewriter effect for clients.
//!
//! Only pure text deltas are split; any event carrying tool calls or other
//! structure passes through untouched.

use std::time::Duration;

use omnigate_protocol::sse::SseFrame;
use serde_json::Value;

#[derive(Debug, Clone, Copy)]
pub struct StreamSmoother {
    pub chunk_chars: usize,
    pub delay: Duration,
}

impl Default for StreamSmoother {
    fn default() -> Self {
        Self {
            chunk_chars: 5,
            delay: Duration::from_millis(15),
        }
    }
}

#[derive(Debug, PartialEq)]
enum TextShape {
    OpenAI,
    Claude,
    Gemini,
}

impl StreamSmoother {
    pub fn new(chunk_chars: usize, delay_ms: u64) -> Self {
        Self {
            chunk_chars: chunk_chars.max(1),
            delay: Duration::from_millis(delay_ms),
        }
    }

    /// Split one frame into smaller frames. Frames that carry no splittable
    /// text come back unchanged as a single element.
    pub fn split(&self, frame: &SseFrame) -> Vec<SseFrame> {
        if frame.is_done_marker() {
            return vec![frame.clone()];
        }
        let Ok(data) = serde_json::from_str::<Value>(&frame.data) else {
            return vec![frame.clone()];
        };
        let Some((text, shape)) = extract_text(&data) else {
            return vec![frame.clone()];
        };
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= self.chunk_chars {
            return vec![frame.clone()];
        }

        chars
            .chunks(self.chunk_chars)
            .enumerate()
            .map(|(position, piece)| {
                let piece: String = piece.iter().collect();
                let rewritten = rewrite_text(&data, &piece, &shape, position == 0);
                SseFrame {
                    event: frame.event.clone(),
                    data: rewritten.to_string(),
                }
            })
            .collect()
    }

    /// The inter-chunk pause the forwarder sleeps between split frames.
    pub async fn pace(&self) {
        tokio::time::sleep(self.delay).await;
    }
}

/// Detect a splittable text delta for each of the three stream formats.
fn extract_text(data: &Value) -> Option<(String, TextShape)> {
    // openai: choices[0].delta.content, delta limited to role/content
    if let Some(choices) = data.get("choices").and_then(Value::as_array)
        && choices.len() == 1
        && let Some(delta) = choices[0].get("delta").and_then(Value::as_object)
        && let Some(content) = delta.get("content").and_then(Value::as_str)
        && delta.keys().all(|key| key == "role" || key == "content")
    {
        return Some((content.to_string(), TextShape::OpenAI));
    }

    // claude: content_block_delta with a text_delta
    if data.get("type").and_then(Value::as_str) == Some("content_block_delta")
        && let Some(delta) = data.get("delta")
        && delta.get("type").and_then(Value::as_str) == Some("text_delta")
        && let Some(text) = delta.get("text").and_then(Value::as_str)
    {
        return Some((text.to_string(), TextShape::Claude));
    }

    // gemini: single candidate, single pure-text part
    if let Some(candidates) = data.get("candidates").and_then(Value::as_array)
        && candidates.len() == 1
        && let Some(parts) = candidates[0]
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
        && parts.len() == 1
        && let Some(part) = parts[0].as_object()
        && part.len() == 1
        && let Some(text) = part.get("text").and_then(Value::as_str)
    {
        return Some((text.to_string(), TextShape::Gemini));
    }

    None
}

fn rewrite_text(original: &Value, piece: &str, shape: &TextShape, is_first: bool) -> Value {
    let mut data = original.clone();
    match shape {
        TextShape::OpenAI => {
            if let Some(delta) = data
                .pointer_mut("/choices/0/delta")
                .and_then(Value::as_object_mut)
            {
                // Only the first split chunk keeps the role.
                if !is_first {
                    delta.remove("role");
                }
                delta.insert("content".to_string(), Value::String(piece.to_string()));
            }
        }
        TextShape::Claude => {
            if let Some(delta) = data.pointer_mut("/delta") {
                delta["text"] = Value::String(piece.to_string());
            }
        }
        TextShape::Gemini => {
            if let Some(part) = data.pointer_mut("/candidates/0/content/parts/0") {
                part["text"] = Value::String(piece.to_string());
            }
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn concat_openai(frames: &[SseFrame]) -> String {
        frames
            .iter()
            .filter_map(|frame| serde_json::from_str::<Value>(&frame.data).ok())
            .filter_map(|v| {
                v["choices"][0]["delta"]["content"]
                    .as_str()
                    .map(str::to_string)
            })
            .collect()
    }

    #[test]
    fn splits_large_openai_delta_preserving_text() {
        let smoother = StreamSmoother::new(4, 0);
        let frame = SseFrame::data(
            json!({
                "choices": [{"index": 0, "delta": {"role": "assistant", "content": "hello wide world"}}]
            })
            .to_string(),
        );
        let frames = smoother.split(&frame);
        assert!(frames.len() > 1);
        assert_eq!(concat_openai(&frames), "hello wide world");
        // Role only on the first chunk.
        let first: Value = serde_json::from_str(&frames[0].data).unwrap();
        let second: Value = serde_json::from_str(&frames[1].data).unwrap();
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert!(second["choices"][0]["delta"].get("role").is_none());
    }

    #[test]
    fn tool_call_deltas_pass_through_whole() {
        let smoother = StreamSmoother::new(2, 0);
        let frame = SseFrame::data(
            json!({
                "choices": [{"index": 0, "delta": {"content": "irrelevant", "tool_calls": []}}]
            })
            .to_string(),
        );
        assert_eq!(smoother.split(&frame).len(), 1);
    }

    #[test]
    fn splits_claude_text_delta() {
        let smoother = StreamSmoother::new(3, 0);
        let frame = SseFrame::named(
            "content_block_delta",
            json!({
                "type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "abcdefgh"}
            })
            .to_string(),
        );
        let frames = smoother.split(&frame);
        let text: String = frames
            .iter()
            .filter_map(|frame| serde_json::from_str::<Value>(&frame.data).ok())
            .filter_map(|v| v["delta"]["text"].as_str().map(str::to_string))
            .collect();
        assert_eq!(text, "abcdefgh");
        assert!(frames.iter().all(|f| f.event.as_deref() == Some("content_block_delta")));
    }

    #[test]
    fn splits_by_characters_not_bytes() {
        let smoother = StreamSmoother::new(2, 0);
        let frame = SseFrame::data(
            json!({
                "candidates": [{"content": {"parts": [{"text": "日本語のテキスト"}]}}]
            })
            .to_string(),
        );
        let frames = smoother.split(&frame);
        let text: String = frames
            .iter()
            .filter_map(|frame| serde_json::from_str::<Value>(&frame.data).ok())
            .filter_map(|v| {
                v["candidates"][0]["content"]["parts"][0]["text"]
                    .as_str()
                    .map(str::to_string)
            })
            .collect();
        assert_eq!(text, "日本語のテキスト");
    }

    #[test]
    fn done_marker_is_untouched() {
        let smoother = StreamSmoother::default();
        let frame = SseFrame::data("[DONE]");
        assert_eq!(smoother.split(&frame), vec![frame]);
    }
}
