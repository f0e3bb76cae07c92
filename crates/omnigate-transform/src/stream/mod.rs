//! Streaming converters: per-request state machines translating upstream
//! SSE events into the client family's events.
//!
//! Converters are event-local wherever possible; the unavoidable cross-event
//! state (tool-call argument assembly, block indexing) lives in each state
//! struct. Malformed frames are skipped; the client family's termination
//! marker is always produced.

pub mod claude2gemini;
pub mod claude2openai;
pub mod gemini2claude;
pub mod gemini2openai;
pub mod openai2claude;
pub mod openai2gemini;
pub mod openai_chat2response;
pub mod openai_response2chat;

use omnigate_protocol::sse::SseFrame;
use omnigate_protocol::{claude, openai};

pub(crate) fn claude_frame(event: &claude::StreamEvent) -> SseFrame {
    SseFrame::named(
        event.event_name(),
        serde_json::to_string(event).unwrap_or_default(),
    )
}

pub(crate) fn response_frame(event: &openai::ResponseStreamEvent) -> SseFrame {
    SseFrame::named(
        event.event_name(),
        serde_json::to_string(event).unwrap_or_default(),
    )
}

pub(crate) fn json_frame<T: serde::Serialize>(value: &T) -> SseFrame {
    SseFrame::data(serde_json::to_string(value).unwrap_or_default())
}

pub(crate) fn openai_finish_to_claude(reason: &str) -> &'static str {
    match reason {
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        "content_filter" => "refusal",
        _ => "end_turn",
    }
}

pub(crate) fn claude_stop_to_openai(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "refusal" => "content_filter",
        _ => "stop",
    }
}

pub(crate) fn gemini_finish_to_openai(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    }
}

pub(crate) fn gemini_finish_to_claude(reason: &str) -> &'static str {
    match reason {
        "MAX_TOKENS" => "max_tokens",
        "SAFETY" | "RECITATION" | "PROHIBITED_CONTENT" => "refusal",
        _ => "end_turn",
    }
}

pub(crate) fn openai_finish_to_gemini(reason: &str) -> &'static str {
    match reason {
        "length" => "MAX_TOKENS",
        "content_filter" => "SAFETY",
        _ => "STOP",
    }
}

pub(crate) fn claude_stop_to_gemini(reason: &str) -> &'static str {
    match reason {
        "max_tokens" => "MAX_TOKENS",
        "refusal" => "SAFETY",
        _ => "STOP",
    }
}

/// Skeleton claude message for `message_start`.
pub(crate) fn claude_message_skeleton(id: &str, model: &str) -> claude::Message {
    claude::Message {
        id: id.to_string(),
        r#type: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content: Vec::new(),
        stop_reason: None,
        stop_sequence: None,
        usage: claude::Usage::default(),
        extra: Default::default(),
    }
}
