//! Client-facing proxy handlers: authenticate, normalize, dispatch, stream.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;
use uuid::Uuid;

use omnigate_common::{ApiFamily, EndpointKind, EndpointSignature, ErrorCategory};
use omnigate_dispatch::planner::normalize_model;
use omnigate_dispatch::{
    DispatchBody, DispatchError, RequiredCapabilities, ResolvedRequest, auth,
};
use omnigate_protocol::{claude, gemini, openai};

use crate::AppState;

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(text) = value.to_str()
        && let Some(token) = text.strip_prefix("Bearer ")
    {
        return Some(token.to_string());
    }
    // claude clients authenticate with x-api-key; gemini with x-goog-api-key.
    for name in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(name)
            && let Ok(text) = value.to_str()
        {
            return Some(text.to_string());
        }
    }
    None
}

fn error_response(err: &DispatchError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if let Some(body) = &err.upstream_body
        && !body.is_empty()
    {
        // Last-attempt upstream errors pass through verbatim.
        return (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            body.clone(),
        )
            .into_response();
    }
    let payload = serde_json::json!({
        "error": {
            "type": err.category.as_str(),
            "message": err.message,
        }
    });
    (status, axum::Json(payload)).into_response()
}

async fn run_dispatch(
    state: &AppState,
    headers: &HeaderMap,
    signature: EndpointSignature,
    body: Value,
    requested_model: String,
    is_stream: bool,
    capabilities: RequiredCapabilities,
) -> Response {
    let (resolved, key_guard) = match resolve(
        state,
        headers,
        signature,
        body,
        requested_model,
        is_stream,
        capabilities,
    )
    .await
    {
        Ok(resolved) => resolved,
        Err(err) => return error_response(&err),
    };
    // Held for the life of the exchange; dropped when the response (or the
    // stream forwarder's channel) is done being produced.
    let _key_guard = key_guard;

    match state.dispatcher.dispatch(resolved).await {
        Ok(outcome) => {
            let status =
                StatusCode::from_u16(outcome.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            match outcome.body {
                DispatchBody::Json(bytes) => (
                    status,
                    [(header::CONTENT_TYPE, outcome.content_type)],
                    bytes,
                )
                    .into_response(),
                DispatchBody::Stream(rx) => {
                    let stream =
                        ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>);
                    Response::builder()
                        .status(status)
                        .header(header::CONTENT_TYPE, "text/event-stream")
                        .header(header::CACHE_CONTROL, "no-cache")
                        .body(Body::from_stream(stream))
                        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
                }
            }
        }
        Err(err) => error_response(&err),
    }
}

async fn resolve(
    state: &AppState,
    headers: &HeaderMap,
    signature: EndpointSignature,
    body: Value,
    requested_model: String,
    is_stream: bool,
    capabilities: RequiredCapabilities,
) -> Result<(ResolvedRequest, omnigate_dispatch::KeyGuard), DispatchError> {
    let Some(token) = bearer_token(headers) else {
        return Err(DispatchError::new(
            ErrorCategory::AuthenticationFailed,
            "missing API key",
        ));
    };
    let (api_key, user) = auth::authenticate(&state.storage, &token).await?;
    auth::check_key_allow_lists(&api_key, signature, &requested_model)?;
    if let Some(user) = &user {
        auth::check_user_quota(user)?;
    }
    let key_guard = state
        .key_limiter
        .admit(&api_key, time::OffsetDateTime::now_utc())?;
    let _ = state.storage.touch_api_key(api_key.id).await;

    let snapshot = state.storage.load_routing_snapshot().await?;
    let normalized_model = normalize_model(&snapshot, &requested_model);
    let affinity_key = ResolvedRequest::affinity_for_key(api_key.id);

    Ok((
        ResolvedRequest {
            request_id: Uuid::new_v4().to_string(),
            api_key,
            user,
            client_signature: signature,
            requested_model,
            normalized_model,
            capabilities,
            body,
            is_stream,
            affinity_key,
            metadata: None,
        },
        key_guard,
    ))
}

fn model_from_body(body: &Value) -> String {
    body.get("model")
        .and_then(|model| model.as_str())
        .unwrap_or_default()
        .to_string()
}

fn stream_from_body(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}

pub async fn openai_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let signature = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Chat);
    let capabilities = match serde_json::from_value::<openai::ChatCompletionRequest>(body.clone()) {
        Ok(request) => RequiredCapabilities {
            vision: request.uses_vision(),
            function_calling: request.uses_tools(),
            extended_thinking: false,
        },
        Err(err) => {
            return error_response(&DispatchError::new(
                ErrorCategory::InvalidRequest,
                format!("invalid chat completion request: {err}"),
            ));
        }
    };
    let model = model_from_body(&body);
    let is_stream = stream_from_body(&body);
    run_dispatch(&state, &headers, signature, body, model, is_stream, capabilities).await
}

pub async fn openai_responses(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let signature = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Cli);
    let model = model_from_body(&body);
    let is_stream = stream_from_body(&body);
    run_dispatch(
        &state,
        &headers,
        signature,
        body,
        model,
        is_stream,
        RequiredCapabilities::default(),
    )
    .await
}

pub async fn openai_video_create(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let signature = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Video);
    let model = model_from_body(&body);
    run_dispatch(
        &state,
        &headers,
        signature,
        body,
        model,
        false,
        RequiredCapabilities::default(),
    )
    .await
}

/// Job status reads come from the gateway's own store, not the upstream;
/// the poller owns upstream polling.
pub async fn openai_video_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(&DispatchError::new(
            ErrorCategory::AuthenticationFailed,
            "missing API key",
        ));
    };
    if let Err(err) = auth::authenticate(&state.storage, &token).await {
        return error_response(&err);
    }
    match state.storage.find_video_task_by_request_id(&id).await {
        Ok(Some(task)) => {
            let hidden = task.error_code.as_deref() == Some("billing_incomplete");
            let payload = serde_json::json!({
                "id": task.request_id,
                "status": task.status,
                "progress": task.progress,
                "url": if hidden {
                    Value::Null
                } else {
                    task.result_urls
                        .as_ref()
                        .and_then(|urls| urls.get(0))
                        .cloned()
                        .unwrap_or(Value::Null)
                },
                "error": task.error_code,
            });
            axum::Json(payload).into_response()
        }
        Ok(None) => error_response(&DispatchError::new(
            ErrorCategory::NotFound,
            "unknown video job",
        )),
        Err(err) => {
            warn!(error = %err, "video job lookup failed");
            error_response(&DispatchError::new(ErrorCategory::Internal, "lookup failed"))
        }
    }
}

pub async fn openai_images(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let signature = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Images);
    let model = model_from_body(&body);
    run_dispatch(
        &state,
        &headers,
        signature,
        body,
        model,
        false,
        RequiredCapabilities::default(),
    )
    .await
}

pub async fn openai_embeddings(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let signature = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Embeddings);
    let model = model_from_body(&body);
    run_dispatch(
        &state,
        &headers,
        signature,
        body,
        model,
        false,
        RequiredCapabilities::default(),
    )
    .await
}

pub async fn openai_audio(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let signature = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Audio);
    let model = model_from_body(&body);
    run_dispatch(
        &state,
        &headers,
        signature,
        body,
        model,
        false,
        RequiredCapabilities::default(),
    )
    .await
}

/// Models list is served from the gateway's own catalog.
pub async fn openai_models(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return error_response(&DispatchError::new(
            ErrorCategory::AuthenticationFailed,
            "missing API key",
        ));
    };
    if let Err(err) = auth::authenticate(&state.storage, &token).await {
        return error_response(&err);
    }
    match state.storage.load_routing_snapshot().await {
        Ok(snapshot) => {
            let data: Vec<Value> = snapshot
                .global_models
                .iter()
                .map(|model| {
                    serde_json::json!({
                        "id": model.name,
                        "object": "model",
                        "owned_by": "omnigate",
                    })
                })
                .collect();
            axum::Json(serde_json::json!({"object": "list", "data": data})).into_response()
        }
        Err(err) => {
            warn!(error = %err, "model catalog load failed");
            error_response(&DispatchError::new(ErrorCategory::Internal, "catalog failed"))
        }
    }
}

pub async fn claude_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let signature = EndpointSignature::new(ApiFamily::Claude, EndpointKind::Chat);
    let capabilities = match serde_json::from_value::<claude::CreateMessageRequest>(body.clone()) {
        Ok(request) => RequiredCapabilities {
            vision: request.uses_vision(),
            function_calling: request.uses_tools(),
            extended_thinking: request.uses_thinking(),
        },
        Err(err) => {
            return error_response(&DispatchError::new(
                ErrorCategory::InvalidRequest,
                format!("invalid messages request: {err}"),
            ));
        }
    };
    let model = model_from_body(&body);
    let is_stream = stream_from_body(&body);
    run_dispatch(&state, &headers, signature, body, model, is_stream, capabilities).await
}

/// Gemini routes carry `{model}:{action}` in the final path segment.
pub async fn gemini_generate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(model_action): Path<String>,
    axum::Json(mut body): axum::Json<Value>,
) -> Response {
    let Some((model, action)) = model_action.rsplit_once(':') else {
        return error_response(&DispatchError::new(
            ErrorCategory::InvalidRequest,
            "expected models/{model}:{action}",
        ));
    };
    let is_stream = action.eq_ignore_ascii_case("streamGenerateContent");
    if !is_stream && !action.eq_ignore_ascii_case("generateContent") {
        return error_response(&DispatchError::new(
            ErrorCategory::InvalidRequest,
            format!("unsupported action: {action}"),
        ));
    }

    let capabilities = match serde_json::from_value::<gemini::GenerateContentRequest>(body.clone())
    {
        Ok(request) => RequiredCapabilities {
            vision: request.uses_vision(),
            function_calling: request.uses_tools(),
            extended_thinking: request.uses_thinking(),
        },
        Err(err) => {
            return error_response(&DispatchError::new(
                ErrorCategory::InvalidRequest,
                format!("invalid generateContent request: {err}"),
            ));
        }
    };

    // The URL is authoritative for this family's model name.
    if let Some(map) = body.as_object_mut() {
        map.insert("model".to_string(), Value::String(model.to_string()));
    }
    let signature = EndpointSignature::new(ApiFamily::Gemini, EndpointKind::Chat);
    run_dispatch(
        &state,
        &headers,
        signature,
        body,
        model.to_string(),
        is_stream,
        capabilities,
    )
    .await
}
