//! Pairwise converter registry over endpoint signatures.
//!
//! Request conversion is a pure body rewrite; streaming conversion is a
//! per-request state machine fed parsed SSE frames from the upstream and
//! yielding frames shaped for the client.
//!
//! Identity applies only to exact signature equality: `openai:chat` and
//! `openai:cli` share a family but not a wire shape, so the Responses pair
//! converts like any other. Cross-family conversions touching `openai:cli`
//! compose through the chat shape.

use omnigate_common::{ApiFamily, EndpointKind, EndpointSignature};
use omnigate_protocol::sse::SseFrame;
use serde_json::Value;

use crate::stream;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransformError {
    #[error("unsupported conversion: {from} -> {to}")]
    UnsupportedConversion {
        from: EndpointSignature,
        to: EndpointSignature,
    },
    #[error("request body is not valid for {family}: {reason}")]
    InvalidBody { family: ApiFamily, reason: String },
}

/// Chat-capable signatures are convertible pairwise; other kinds only pass
/// through unchanged.
fn is_chat_like(signature: EndpointSignature) -> bool {
    matches!(signature.kind, EndpointKind::Chat | EndpointKind::Cli)
}

/// Whether a chat-like signature deviates from its family's chat wire
/// shape. Only the openai Responses surface does; claude has a single chat
/// format and gemini:cli reuses generateContent under an envelope.
fn is_openai_responses(signature: EndpointSignature) -> bool {
    signature.family == ApiFamily::OpenAI && signature.kind == EndpointKind::Cli
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConverterRegistry;

impl ConverterRegistry {
    pub fn supports(&self, from: EndpointSignature, to: EndpointSignature) -> bool {
        if from == to {
            return true;
        }
        is_chat_like(from) && is_chat_like(to)
    }
}

/// Rewrite a request body from the client signature to the upstream
/// signature. Identity holds only for exact signature equality; variant
/// hooks apply provider quirks afterwards.
pub fn convert_request(
    body: Value,
    from: EndpointSignature,
    to: EndpointSignature,
) -> Result<Value, TransformError> {
    if from == to {
        return Ok(body);
    }
    if !is_chat_like(from) || !is_chat_like(to) {
        return Err(TransformError::UnsupportedConversion { from, to });
    }

    // Normalize an openai Responses source to the chat shape first.
    let body = if is_openai_responses(from) {
        crate::request::openai_response2chat::convert(body)?
    } else {
        body
    };

    let body = match (from.family, to.family) {
        (ApiFamily::OpenAI, ApiFamily::OpenAI) => body,
        (ApiFamily::OpenAI, ApiFamily::Claude) => crate::request::openai2claude::convert(body)?,
        (ApiFamily::OpenAI, ApiFamily::Gemini) => crate::request::openai2gemini::convert(body)?,
        (ApiFamily::Claude, ApiFamily::OpenAI) => crate::request::claude2openai::convert(body)?,
        (ApiFamily::Claude, ApiFamily::Gemini) => crate::request::claude2gemini::convert(body)?,
        (ApiFamily::Gemini, ApiFamily::OpenAI) => crate::request::gemini2openai::convert(body)?,
        (ApiFamily::Gemini, ApiFamily::Claude) => crate::request::gemini2claude::convert(body)?,
        (ApiFamily::Claude, ApiFamily::Claude) | (ApiFamily::Gemini, ApiFamily::Gemini) => body,
    };

    // Reshape into the openai Responses format when that is the target.
    if is_openai_responses(to) {
        return crate::request::openai_chat2response::convert(body);
    }
    Ok(body)
}

/// Streaming converter from the upstream family to the client family.
///
/// Malformed frames are skipped (logged by the caller); the termination
/// marker of the client family is always produced by `finish`.
pub enum StreamConverter {
    Passthrough,
    OpenAIToClaude(stream::openai2claude::State),
    OpenAIToGemini(stream::openai2gemini::State),
    ClaudeToOpenAI(stream::claude2openai::State),
    ClaudeToGemini(stream::claude2gemini::State),
    GeminiToOpenAI(stream::gemini2openai::State),
    GeminiToClaude(stream::gemini2claude::State),
    ResponseToChat(stream::openai_response2chat::State),
    ChatToResponse(stream::openai_chat2response::State),
    /// Cross-family conversion through the openai chat shape, e.g. an
    /// openai:cli upstream serving a claude client.
    Chain(Box<StreamConverter>, Box<StreamConverter>),
}

impl StreamConverter {
    /// `upstream` is the signature of the bytes coming in; `client` is the
    /// signature of the frames going out.
    pub fn new(
        upstream: EndpointSignature,
        client: EndpointSignature,
        model: &str,
    ) -> Result<Self, TransformError> {
        if upstream == client {
            return Ok(StreamConverter::Passthrough);
        }
        if !is_chat_like(upstream) || !is_chat_like(client) {
            return Err(TransformError::UnsupportedConversion {
                from: upstream,
                to: client,
            });
        }

        let openai_chat = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Chat);

        // Responses on either side route through the chat shape.
        if is_openai_responses(upstream) {
            let head = StreamConverter::ResponseToChat(stream::openai_response2chat::State::new(
                model,
            ));
            if client == openai_chat {
                return Ok(head);
            }
            let tail = StreamConverter::new(openai_chat, client, model)?;
            return Ok(StreamConverter::Chain(Box::new(head), Box::new(tail)));
        }
        if is_openai_responses(client) {
            if upstream == openai_chat {
                return Ok(StreamConverter::ChatToResponse(
                    stream::openai_chat2response::State::new(model),
                ));
            }
            let head = StreamConverter::new(upstream, openai_chat, model)?;
            let tail = StreamConverter::ChatToResponse(stream::openai_chat2response::State::new(
                model,
            ));
            return Ok(StreamConverter::Chain(Box::new(head), Box::new(tail)));
        }

        Ok(match (upstream.family, client.family) {
            (ApiFamily::OpenAI, ApiFamily::Claude) => {
                StreamConverter::OpenAIToClaude(stream::openai2claude::State::new(model))
            }
            (ApiFamily::OpenAI, ApiFamily::Gemini) => {
                StreamConverter::OpenAIToGemini(stream::openai2gemini::State::new(model))
            }
            (ApiFamily::Claude, ApiFamily::OpenAI) => {
                StreamConverter::ClaudeToOpenAI(stream::claude2openai::State::new(model))
            }
            (ApiFamily::Claude, ApiFamily::Gemini) => {
                StreamConverter::ClaudeToGemini(stream::claude2gemini::State::new(model))
            }
            (ApiFamily::Gemini, ApiFamily::OpenAI) => {
                StreamConverter::GeminiToOpenAI(stream::gemini2openai::State::new(model))
            }
            (ApiFamily::Gemini, ApiFamily::Claude) => {
                StreamConverter::GeminiToClaude(stream::gemini2claude::State::new(model))
            }
            // Same family, different kind, same wire shape (gemini chat/cli).
            _ => StreamConverter::Passthrough,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, StreamConverter::Passthrough)
    }

    /// Feed one upstream frame; returns the frames for the client.
    pub fn push(&mut self, frame: &SseFrame) -> Vec<SseFrame> {
        match self {
            StreamConverter::Passthrough => vec![frame.clone()],
            StreamConverter::OpenAIToClaude(state) => state.push(frame),
            StreamConverter::OpenAIToGemini(state) => state.push(frame),
            StreamConverter::ClaudeToOpenAI(state) => state.push(frame),
            StreamConverter::ClaudeToGemini(state) => state.push(frame),
            StreamConverter::GeminiToOpenAI(state) => state.push(frame),
            StreamConverter::GeminiToClaude(state) => state.push(frame),
            StreamConverter::ResponseToChat(state) => state.push(frame),
            StreamConverter::ChatToResponse(state) => state.push(frame),
            StreamConverter::Chain(head, tail) => head
                .push(frame)
                .iter()
                .flat_map(|intermediate| tail.push(intermediate))
                .collect(),
        }
    }

    /// End of upstream stream: flush whatever the client family still needs.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        match self {
            StreamConverter::Passthrough => Vec::new(),
            StreamConverter::OpenAIToClaude(state) => state.finish(),
            StreamConverter::OpenAIToGemini(state) => state.finish(),
            StreamConverter::ClaudeToOpenAI(state) => state.finish(),
            StreamConverter::ClaudeToGemini(state) => state.finish(),
            StreamConverter::GeminiToOpenAI(state) => state.finish(),
            StreamConverter::GeminiToClaude(state) => state.finish(),
            StreamConverter::ResponseToChat(state) => state.finish(),
            StreamConverter::ChatToResponse(state) => state.finish(),
            StreamConverter::Chain(head, tail) => {
                let mut out: Vec<SseFrame> = head
                    .finish()
                    .iter()
                    .flat_map(|intermediate| tail.push(intermediate))
                    .collect();
                out.extend(tail.finish());
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnigate_common::{ApiFamily, EndpointKind};

    fn sig(family: ApiFamily) -> EndpointSignature {
        EndpointSignature::new(family, EndpointKind::Chat)
    }

    fn cli(family: ApiFamily) -> EndpointSignature {
        EndpointSignature::new(family, EndpointKind::Cli)
    }

    #[test]
    fn identity_requires_exact_signature_equality() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let same =
            convert_request(body.clone(), sig(ApiFamily::OpenAI), sig(ApiFamily::OpenAI)).unwrap();
        assert_eq!(same, body);

        // Same family, different kind: the body must be reshaped.
        let reshaped =
            convert_request(body, sig(ApiFamily::OpenAI), cli(ApiFamily::OpenAI)).unwrap();
        assert!(reshaped.get("messages").is_none());
        assert_eq!(reshaped["input"][0]["content"], "hi");
    }

    #[test]
    fn responses_request_converts_back_to_chat() {
        let body = serde_json::json!({
            "model": "gpt-5",
            "instructions": "be brief",
            "input": [{"type": "message", "role": "user", "content": "hi"}]
        });
        let converted =
            convert_request(body, cli(ApiFamily::OpenAI), sig(ApiFamily::OpenAI)).unwrap();
        assert_eq!(converted["messages"][0]["role"], "system");
        assert_eq!(converted["messages"][1]["content"], "hi");
    }

    #[test]
    fn claude_to_openai_cli_composes_through_chat() {
        let body = serde_json::json!({
            "model": "gpt-5",
            "max_tokens": 64,
            "system": "be brief",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let converted =
            convert_request(body, sig(ApiFamily::Claude), cli(ApiFamily::OpenAI)).unwrap();
        assert_eq!(converted["instructions"], "be brief");
        assert_eq!(converted["input"][0]["content"], "hi");
        assert_eq!(converted["max_output_tokens"], 64);
    }

    #[test]
    fn non_chat_kinds_do_not_cross_families() {
        let from = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Video);
        let to = EndpointSignature::new(ApiFamily::Gemini, EndpointKind::Video);
        assert!(matches!(
            convert_request(serde_json::json!({}), from, to),
            Err(TransformError::UnsupportedConversion { .. })
        ));
        assert!(!ConverterRegistry.supports(from, to));
    }

    #[test]
    fn supports_matches_convert_request_coverage() {
        let registry = ConverterRegistry;
        assert!(registry.supports(sig(ApiFamily::OpenAI), cli(ApiFamily::OpenAI)));
        assert!(registry.supports(cli(ApiFamily::OpenAI), sig(ApiFamily::Claude)));
        assert!(registry.supports(sig(ApiFamily::Gemini), sig(ApiFamily::Gemini)));
    }

    #[test]
    fn passthrough_stream_echoes_frames() {
        let mut converter =
            StreamConverter::new(sig(ApiFamily::OpenAI), sig(ApiFamily::OpenAI), "m").unwrap();
        assert!(converter.is_passthrough());
        let frame = SseFrame::data("{\"x\":1}");
        assert_eq!(converter.push(&frame), vec![frame]);
    }

    #[test]
    fn chat_to_cli_stream_is_not_passthrough() {
        let converter =
            StreamConverter::new(cli(ApiFamily::OpenAI), sig(ApiFamily::OpenAI), "m").unwrap();
        assert!(!converter.is_passthrough());
        let converter =
            StreamConverter::new(sig(ApiFamily::OpenAI), cli(ApiFamily::OpenAI), "m").unwrap();
        assert!(!converter.is_passthrough());
    }

    #[test]
    fn chained_stream_converts_responses_upstream_for_claude_client() {
        let mut converter =
            StreamConverter::new(cli(ApiFamily::OpenAI), sig(ApiFamily::Claude), "m").unwrap();
        let mut out = Vec::new();
        out.extend(converter.push(&SseFrame::named(
            "response.output_text.delta",
            serde_json::json!({
                "type": "response.output_text.delta", "output_index": 0, "delta": "hi"
            })
            .to_string(),
        )));
        out.extend(converter.finish());

        let text: String = out
            .iter()
            .filter_map(|frame| serde_json::from_str::<serde_json::Value>(&frame.data).ok())
            .filter(|value| value["type"] == "content_block_delta")
            .filter_map(|value| value["delta"]["text"].as_str().map(str::to_string))
            .collect();
        assert_eq!(text, "hi");
        let last: serde_json::Value =
            serde_json::from_str(&out.last().unwrap().data).unwrap();
        assert_eq!(last["type"], "message_stop");
    }
}
