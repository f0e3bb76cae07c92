//! Cross-format round-trip laws: converted requests are well-formed in the
//! target family, and concatenated stream text survives every direction.

use omnigate_common::{ApiFamily, EndpointKind, EndpointSignature};
use omnigate_protocol::sse::SseFrame;
use omnigate_protocol::{claude, gemini, openai};
use omnigate_transform::{StreamConverter, convert_request};
use serde_json::{Value, json};

fn chat(family: ApiFamily) -> EndpointSignature {
    EndpointSignature::new(family, EndpointKind::Chat)
}

fn openai_cli() -> EndpointSignature {
    EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Cli)
}

fn openai_request() -> Value {
    json!({
        "model": "m",
        "stream": true,
        "max_tokens": 64,
        "messages": [
            {"role": "system", "content": "be brief"},
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
            {"role": "user", "content": "bye"}
        ]
    })
}

#[test]
fn openai_request_is_valid_in_every_target_family() {
    let to_claude = convert_request(
        openai_request(),
        chat(ApiFamily::OpenAI),
        chat(ApiFamily::Claude),
    )
    .unwrap();
    let parsed: claude::CreateMessageRequest = serde_json::from_value(to_claude).unwrap();
    assert_eq!(parsed.messages.len(), 3);
    assert_eq!(parsed.system.unwrap().plain_text(), "be brief");

    let to_gemini = convert_request(
        openai_request(),
        chat(ApiFamily::OpenAI),
        chat(ApiFamily::Gemini),
    )
    .unwrap();
    let parsed: gemini::GenerateContentRequest = serde_json::from_value(to_gemini).unwrap();
    assert_eq!(parsed.contents.len(), 3);
    assert_eq!(
        parsed.generation_config.unwrap().max_output_tokens,
        Some(64)
    );
}

#[test]
fn claude_request_is_valid_in_every_target_family() {
    let body = json!({
        "model": "gemini-2.0-flash",
        "stream": true,
        "max_tokens": 64,
        "messages": [{"role": "user", "content": "hi"}]
    });
    let to_gemini = convert_request(
        body.clone(),
        chat(ApiFamily::Claude),
        chat(ApiFamily::Gemini),
    )
    .unwrap();
    assert_eq!(to_gemini["contents"][0]["role"], "user");
    assert_eq!(to_gemini["contents"][0]["parts"][0]["text"], "hi");
    assert_eq!(to_gemini["generationConfig"]["maxOutputTokens"], 64);

    let to_openai =
        convert_request(body, chat(ApiFamily::Claude), chat(ApiFamily::OpenAI)).unwrap();
    let parsed: openai::ChatCompletionRequest = serde_json::from_value(to_openai).unwrap();
    assert_eq!(parsed.max_tokens, Some(64));
}

#[test]
fn identity_conversion_is_the_input() {
    let body = openai_request();
    let out = convert_request(
        body.clone(),
        chat(ApiFamily::OpenAI),
        chat(ApiFamily::OpenAI),
    )
    .unwrap();
    assert_eq!(out, body);
}

#[test]
fn chat_to_cli_is_a_real_conversion_despite_the_shared_family() {
    let to_cli = convert_request(openai_request(), chat(ApiFamily::OpenAI), openai_cli()).unwrap();
    let parsed: openai::ResponsesRequest = serde_json::from_value(to_cli.clone()).unwrap();
    assert_eq!(parsed.instructions.as_deref(), Some("be brief"));
    assert_eq!(parsed.max_output_tokens, Some(64));
    assert!(to_cli.get("messages").is_none());

    // And back: the Responses shape converts into chat messages.
    let to_chat = convert_request(to_cli, openai_cli(), chat(ApiFamily::OpenAI)).unwrap();
    let parsed: openai::ChatCompletionRequest = serde_json::from_value(to_chat).unwrap();
    assert_eq!(parsed.messages[0].role, openai::ChatRole::System);
    assert_eq!(parsed.messages.len(), 4);
}

fn openai_upstream_frames(pieces: &[&str]) -> Vec<SseFrame> {
    let mut frames: Vec<SseFrame> = pieces
        .iter()
        .map(|piece| {
            SseFrame::data(
                json!({
                    "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
                    "choices": [{"index": 0, "delta": {"content": piece}}]
                })
                .to_string(),
            )
        })
        .collect();
    frames.push(SseFrame::data(
        json!({
            "id": "c", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        })
        .to_string(),
    ));
    frames.push(SseFrame::data("[DONE]"));
    frames
}

fn claude_upstream_frames(pieces: &[&str]) -> Vec<SseFrame> {
    let mut frames = vec![SseFrame::named(
        "message_start",
        json!({
            "type": "message_start",
            "message": {"id": "msg", "type": "message", "role": "assistant", "model": "m",
                        "content": [], "usage": {"input_tokens": 3, "output_tokens": 0}}
        })
        .to_string(),
    )];
    frames.push(SseFrame::named(
        "content_block_start",
        json!({"type": "content_block_start", "index": 0,
               "content_block": {"type": "text", "text": ""}})
        .to_string(),
    ));
    for piece in pieces {
        frames.push(SseFrame::named(
            "content_block_delta",
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "text_delta", "text": piece}})
            .to_string(),
        ));
    }
    frames.push(SseFrame::named(
        "content_block_stop",
        json!({"type": "content_block_stop", "index": 0}).to_string(),
    ));
    frames.push(SseFrame::named(
        "message_delta",
        json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"},
               "usage": {"input_tokens": 3, "output_tokens": 2}})
        .to_string(),
    ));
    frames.push(SseFrame::named(
        "message_stop",
        json!({"type": "message_stop"}).to_string(),
    ));
    frames
}

fn responses_upstream_frames(pieces: &[&str]) -> Vec<SseFrame> {
    let mut frames: Vec<SseFrame> = pieces
        .iter()
        .map(|piece| {
            SseFrame::named(
                "response.output_text.delta",
                json!({
                    "type": "response.output_text.delta", "output_index": 0, "delta": piece
                })
                .to_string(),
            )
        })
        .collect();
    frames.push(SseFrame::named(
        "response.completed",
        json!({
            "type": "response.completed",
            "response": {"id": "resp", "object": "response", "model": "m",
                          "status": "completed", "output": [],
                          "usage": {"input_tokens": 3, "output_tokens": 2,
                                     "total_tokens": 5}}
        })
        .to_string(),
    ));
    frames
}

fn gemini_upstream_frames(pieces: &[&str]) -> Vec<SseFrame> {
    let mut frames: Vec<SseFrame> = pieces
        .iter()
        .map(|piece| {
            SseFrame::data(
                json!({
                    "candidates": [{"content": {"role": "model", "parts": [{"text": piece}]},
                                     "index": 0}]
                })
                .to_string(),
            )
        })
        .collect();
    frames.push(SseFrame::data(
        json!({
            "candidates": [{"content": {"role": "model", "parts": []},
                             "finishReason": "STOP", "index": 0}],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2,
                               "totalTokenCount": 5}
        })
        .to_string(),
    ));
    frames
}

/// Concatenate the text deltas of client-signature frames.
fn client_text(signature: EndpointSignature, frames: &[SseFrame]) -> String {
    frames
        .iter()
        .filter(|frame| !frame.is_done_marker())
        .filter_map(|frame| serde_json::from_str::<Value>(&frame.data).ok())
        .filter_map(|value| match signature.family {
            ApiFamily::OpenAI if signature.kind == EndpointKind::Cli => {
                (value["type"] == "response.output_text.delta")
                    .then(|| value["delta"].as_str().map(str::to_string))
                    .flatten()
            }
            ApiFamily::OpenAI => value["choices"][0]["delta"]["content"]
                .as_str()
                .map(str::to_string),
            ApiFamily::Claude => {
                (value["type"] == "content_block_delta" && value["delta"]["type"] == "text_delta")
                    .then(|| value["delta"]["text"].as_str().map(str::to_string))
                    .flatten()
            }
            ApiFamily::Gemini => value["candidates"][0]["content"]["parts"][0]["text"]
                .as_str()
                .map(str::to_string),
        })
        .collect()
}

#[test]
fn stream_text_round_trips_for_every_pair() {
    let pieces = ["Hel", "lo ", "world"];
    let cases: Vec<(EndpointSignature, Vec<SseFrame>)> = vec![
        (chat(ApiFamily::OpenAI), openai_upstream_frames(&pieces)),
        (chat(ApiFamily::Claude), claude_upstream_frames(&pieces)),
        (chat(ApiFamily::Gemini), gemini_upstream_frames(&pieces)),
        (openai_cli(), responses_upstream_frames(&pieces)),
    ];
    let clients = [
        chat(ApiFamily::OpenAI),
        chat(ApiFamily::Claude),
        chat(ApiFamily::Gemini),
        openai_cli(),
    ];

    for (upstream, upstream_frames) in &cases {
        for client in clients {
            if client == *upstream {
                continue;
            }
            let mut converter = StreamConverter::new(*upstream, client, "m").unwrap();
            let mut out = Vec::new();
            for frame in upstream_frames {
                out.extend(converter.push(frame));
            }
            out.extend(converter.finish());
            assert_eq!(
                client_text(client, &out),
                "Hello world",
                "text mismatch for {upstream} -> {client}"
            );
        }
    }
}

#[test]
fn converted_streams_end_with_the_client_terminator() {
    let mut converter = StreamConverter::new(
        chat(ApiFamily::Gemini),
        chat(ApiFamily::OpenAI),
        "m",
    )
    .unwrap();
    let mut out = Vec::new();
    for frame in gemini_upstream_frames(&["hi"]) {
        out.extend(converter.push(&frame));
    }
    out.extend(converter.finish());
    assert!(out.last().unwrap().is_done_marker());

    let mut converter = StreamConverter::new(
        chat(ApiFamily::OpenAI),
        chat(ApiFamily::Claude),
        "m",
    )
    .unwrap();
    let mut out = Vec::new();
    for frame in openai_upstream_frames(&["hi"]) {
        out.extend(converter.push(&frame));
    }
    out.extend(converter.finish());
    let last: Value = serde_json::from_str(&out.last().unwrap().data).unwrap();
    assert_eq!(last["type"], "message_stop");
}
