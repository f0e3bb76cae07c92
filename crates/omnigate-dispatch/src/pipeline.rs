//! The dispatcher: one public contract, `dispatch(request)`, executed as a
//! linear state machine with an audit-trail entry per transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tracing::{info, warn};

use omnigate_billing::{BindingValue, FormulaEngine, TieredPricing, compute_token_cost};
use omnigate_common::{ApiFamily, EndpointKind, EndpointSignature, ErrorCategory, FailureTag};
use omnigate_health::{CredentialLimits, HealthManager, InFlightGuard, Outcome};
use omnigate_protocol::sse::{SseDecoder, SseFrame};
use omnigate_protocol::usage::TokenUsage;
use omnigate_storage::video_store::NewVideoTask;
use omnigate_storage::{CandidateLedgerEntry, GatewayStorage, UsageRecordInput};
use omnigate_telemetry::{StreamingStarted, TelemetryWriter};
use omnigate_transform::aggregate::StreamAggregator;
use omnigate_transform::{StreamConverter, StreamSmoother, VariantHook, convert_request};

use crate::client::ClientPool;
use crate::codex::maybe_patch_for_codex;
use crate::error::DispatchError;
use crate::planner::{Candidate, plan_candidates};
use crate::signature_cache::ThoughtSignatureCache;
use crate::transport::{
    build_headers, build_upstream_url, classify_status, classify_transport_error,
    is_hard_input_error, redact_url_for_log,
};
use crate::types::ResolvedRequest;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_retries: usize,
    pub max_candidates: usize,
    pub first_byte_timeout: Duration,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Typewriter smoothing for client streams; None passes chunks whole.
    pub smoother: Option<StreamSmoother>,
    pub video_poll_interval_seconds: i64,
    pub video_max_poll_count: i32,
    pub strict_billing: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_candidates: 8,
            first_byte_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            smoother: None,
            video_poll_interval_seconds: 10,
            video_max_poll_count: 180,
            strict_billing: false,
        }
    }
}

type UpstreamByteStream =
    std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<Bytes, wreq::Error>> + Send>>;

pub enum DispatchBody {
    Json(Bytes),
    /// SSE bytes, already encoded, ready to forward verbatim.
    Stream(mpsc::Receiver<Bytes>),
}

pub struct DispatchOutcome {
    pub status: u16,
    pub content_type: &'static str,
    pub body: DispatchBody,
}

pub struct Dispatcher {
    storage: GatewayStorage,
    health: Arc<HealthManager>,
    telemetry: Arc<dyn TelemetryWriter>,
    clients: Arc<ClientPool>,
    /// Variant hooks keyed by provider_type.
    hooks: HashMap<String, Arc<dyn VariantHook>>,
    signatures: Arc<ThoughtSignatureCache>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        storage: GatewayStorage,
        health: Arc<HealthManager>,
        telemetry: Arc<dyn TelemetryWriter>,
        clients: Arc<ClientPool>,
        hooks: HashMap<String, Arc<dyn VariantHook>>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            storage,
            health,
            telemetry,
            clients,
            hooks,
            signatures: Arc::new(ThoughtSignatureCache::new(Duration::from_secs(600))),
            config,
        }
    }

    pub fn storage(&self) -> &GatewayStorage {
        &self.storage
    }

    /// Dispatch one authenticated, normalized request.
    pub async fn dispatch(
        &self,
        request: ResolvedRequest,
    ) -> Result<DispatchOutcome, DispatchError> {
        let snapshot = self.storage.load_routing_snapshot().await?;
        let candidates = plan_candidates(&snapshot, &request, self.config.max_candidates);
        if candidates.is_empty() {
            return Err(DispatchError::new(
                ErrorCategory::NoProvidersAvailable,
                format!("no providers available for model {}", request.normalized_model),
            ));
        }

        let mut last_error: Option<DispatchError> = None;
        let mut attempt_no = 0;

        for candidate in candidates.iter().take(self.config.max_retries.max(1)) {
            attempt_no += 1;
            self.append_ledger(&request, candidate, attempt_no, "selected", None, None)
                .await;

            // Admissibility can change mid-loop: re-check at selection time.
            let mut state = self.health.state_from_row(&candidate.credential);
            let seen_updated_at = candidate.credential.updated_at;
            let limits = CredentialLimits::from(&candidate.credential);
            let guard = match self.health.try_acquire(
                &limits,
                &mut state,
                time::OffsetDateTime::now_utc(),
            ) {
                Ok(guard) => {
                    if guard.is_probe {
                        // Persist the open → half-open transition best-effort.
                        let _ = self
                            .health
                            .persist_state(candidate.credential.id, seen_updated_at, &state)
                            .await;
                    }
                    guard
                }
                Err(skip) => {
                    self.append_ledger(
                        &request,
                        candidate,
                        attempt_no,
                        "skipped",
                        Some(skip.as_str()),
                        None,
                    )
                    .await;
                    continue;
                }
            };

            match self
                .attempt(&request, candidate, attempt_no, guard)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    let stop = !err.category.retries_next_candidate()
                        || err
                            .upstream_body
                            .as_ref()
                            .zip(err.upstream_status)
                            .is_some_and(|(body, status)| {
                                is_hard_input_error(
                                    http::StatusCode::from_u16(status)
                                        .unwrap_or(http::StatusCode::BAD_REQUEST),
                                    body,
                                )
                            });
                    last_error = Some(err);
                    if stop {
                        break;
                    }
                }
            }
        }

        let err = last_error.unwrap_or_else(|| {
            DispatchError::new(
                ErrorCategory::NoProvidersAvailable,
                "every candidate was skipped",
            )
        });
        self.record_failure(&request, &err).await;
        Err(err)
    }

    async fn attempt(
        &self,
        request: &ResolvedRequest,
        candidate: &Candidate,
        attempt_no: i32,
        guard: InFlightGuard,
    ) -> Result<DispatchOutcome, DispatchError> {
        let provider_type = candidate.provider.provider_type.as_deref();
        let hook = provider_type.and_then(|t| self.hooks.get(t)).cloned();
        // Identity is exact signature equality: openai:chat -> openai:cli is
        // a real conversion (Responses wire shape), family match or not.
        let has_conversion = request.client_signature != candidate.upstream_signature;

        // An upstream that only streams still serves non-stream clients:
        // the converted stream aggregates back into one body.
        let upstream_streams = request.is_stream || has_conversion;

        // Translate, rewrite the model to the upstream name, apply hooks.
        let mut body = convert_request(
            request.body.clone(),
            request.client_signature,
            candidate.upstream_signature,
        )
        .map_err(|err| DispatchError::new(ErrorCategory::InvalidRequest, err.to_string()))?;
        rewrite_model_field(&mut body, candidate, upstream_streams, request.is_stream);
        if let Some(hook) = &hook {
            body = hook.wrap_request(body, &candidate.upstream_model);
        }
        body = maybe_patch_for_codex(
            provider_type,
            &candidate.upstream_signature.key(),
            body,
        );

        let base_override = hook.as_ref().and_then(|hook| hook.select_base_url());
        let url = build_upstream_url(
            &candidate.endpoint,
            &candidate.credential,
            candidate.upstream_signature,
            provider_type,
            &candidate.upstream_model,
            upstream_streams,
            base_override.as_deref(),
        )?;
        let base_url = base_override.unwrap_or_else(|| candidate.endpoint.base_url.clone());

        let mut headers = build_headers(
            &candidate.endpoint,
            &candidate.credential,
            candidate.upstream_signature,
        );
        if let Some(hook) = &hook {
            headers.extend(hook.extra_headers());
        }

        let proxy = proxy_url(candidate);
        let client = self
            .clients
            .client_for(proxy.as_deref(), candidate.credential.tls_profile.as_deref())?;

        info!(
            event = "upstream_request",
            request_id = %request.request_id,
            provider = %candidate.provider.name,
            url = %redact_url_for_log(&url),
            model = %candidate.upstream_model,
            is_stream = upstream_streams,
            attempt = attempt_no,
        );
        let started_at = Instant::now();

        let mut builder = client.post(&url).timeout(if upstream_streams {
            self.config.first_byte_timeout + self.config.request_timeout
        } else {
            self.config.request_timeout
        });
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let send = builder
            .body(serde_json::to_vec(&body).unwrap_or_default())
            .send();

        let response = match send.await {
            Ok(response) => response,
            Err(err) => {
                let (category, tag) = classify_transport_error(&err);
                if let Some(hook) = &hook {
                    hook.on_connection_error(&base_url);
                }
                self.finish_failed_attempt(
                    request, candidate, attempt_no, &guard, category, tag, started_at,
                )
                .await;
                return Err(DispatchError::new(category, err.to_string()));
            }
        };

        let status = response.status();
        if let Some(hook) = &hook {
            hook.on_http_status(&base_url, status.as_u16());
        }

        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            let (category, tag) = classify_status(status, &body);
            self.finish_failed_attempt(
                request, candidate, attempt_no, &guard, category, tag, started_at,
            )
            .await;
            return Err(DispatchError::upstream(
                category,
                status.as_u16(),
                body,
                format!("upstream returned {status}"),
            ));
        }

        if candidate.upstream_signature.kind == EndpointKind::Video {
            return self
                .finish_video_submission(request, candidate, attempt_no, guard, response, started_at)
                .await;
        }

        if upstream_streams {
            self.stream_response(
                request, candidate, attempt_no, guard, hook, response, started_at,
            )
            .await
        } else {
            self.buffered_response(request, candidate, attempt_no, guard, hook, response, started_at)
                .await
        }
    }

    /// Non-stream native-format response: pass bytes through, extract usage.
    async fn buffered_response(
        &self,
        request: &ResolvedRequest,
        candidate: &Candidate,
        attempt_no: i32,
        guard: InFlightGuard,
        hook: Option<Arc<dyn VariantHook>>,
        response: wreq::Response,
        started_at: Instant,
    ) -> Result<DispatchOutcome, DispatchError> {
        let status = response.status();
        let raw = response.bytes().await.map_err(|err| {
            let (category, _) = classify_transport_error(&err);
            DispatchError::new(category, err.to_string())
        })?;

        let mut parsed: serde_json::Value =
            serde_json::from_slice(&raw).unwrap_or(serde_json::Value::Null);
        if let Some(hook) = &hook {
            parsed = hook.unwrap_response(parsed);
        }
        if candidate.upstream_signature.family == ApiFamily::Gemini {
            self.signatures
                .capture_from_response(&candidate.upstream_model, &parsed);
        }

        let usage = extract_body_usage(candidate.upstream_signature, &parsed);
        let latency_ms = started_at.elapsed().as_millis() as i64;
        let observed = guard.observed_concurrency;
        drop(guard);

        self.settle_success(
            request, candidate, attempt_no, usage, latency_ms, None, observed, status.as_u16(),
            Some(parsed.clone()),
        )
        .await;

        let body_bytes = if parsed.is_null() {
            raw
        } else {
            Bytes::from(parsed.to_string())
        };
        Ok(DispatchOutcome {
            status: status.as_u16(),
            content_type: "application/json",
            body: DispatchBody::Json(body_bytes),
        })
    }

    /// Streaming: await first byte, emit STREAMING, then forward frames —
    /// byte pass-through when no rewrite is needed, converted otherwise.
    #[allow(clippy::too_many_arguments)]
    async fn stream_response(
        &self,
        request: &ResolvedRequest,
        candidate: &Candidate,
        attempt_no: i32,
        guard: InFlightGuard,
        hook: Option<Arc<dyn VariantHook>>,
        response: wreq::Response,
        started_at: Instant,
    ) -> Result<DispatchOutcome, DispatchError> {
        let status = response.status();
        let mut upstream: UpstreamByteStream = Box::pin(response.bytes_stream());

        let first_chunk = match timeout(self.config.first_byte_timeout, upstream.next()).await {
            Ok(Some(Ok(chunk))) => chunk,
            Ok(Some(Err(err))) => {
                let (category, tag) = classify_transport_error(&err);
                self.finish_failed_attempt(
                    request, candidate, attempt_no, &guard, category, tag, started_at,
                )
                .await;
                return Err(DispatchError::new(category, err.to_string()));
            }
            Ok(None) => Bytes::new(),
            Err(_) => {
                self.finish_failed_attempt(
                    request,
                    candidate,
                    attempt_no,
                    &guard,
                    ErrorCategory::UpstreamTimeout,
                    FailureTag::Timeout,
                    started_at,
                )
                .await;
                return Err(DispatchError::new(
                    ErrorCategory::UpstreamTimeout,
                    "no first byte before deadline",
                ));
            }
        };

        let first_byte_ms = started_at.elapsed().as_millis() as i64;
        let _ = self
            .telemetry
            .streaming_started(StreamingStarted {
                request_id: request.request_id.clone(),
                first_byte_time_ms: first_byte_ms,
            })
            .await;

        let force_rewrite = hook
            .as_ref()
            .is_some_and(|hook| hook.force_stream_rewrite());
        let converter = StreamConverter::new(
            candidate.upstream_signature,
            request.client_signature,
            &request.requested_model,
        )
        .map_err(|err| DispatchError::new(ErrorCategory::InvalidRequest, err.to_string()))?;

        let (tx, rx) = mpsc::channel::<Bytes>(64);
        let job = StreamJob {
            dispatcher: self.clone_refs(),
            request: request.clone(),
            candidate: candidate.clone(),
            attempt_no,
            guard,
            hook,
            converter,
            force_rewrite,
            smoother: self.config.smoother,
            client_wants_stream: request.is_stream,
            started_at,
            first_byte_ms,
        };
        if request.is_stream {
            tokio::spawn(job.run(first_chunk, upstream, tx));
            Ok(DispatchOutcome {
                status: status.as_u16(),
                content_type: "text/event-stream",
                body: DispatchBody::Stream(rx),
            })
        } else {
            // Aggregate the converted stream into one body for the client.
            let body = job.run_to_body(first_chunk, upstream).await?;
            Ok(DispatchOutcome {
                status: status.as_u16(),
                content_type: "application/json",
                body: DispatchBody::Json(body),
            })
        }
    }

    async fn finish_video_submission(
        &self,
        request: &ResolvedRequest,
        candidate: &Candidate,
        attempt_no: i32,
        guard: InFlightGuard,
        response: wreq::Response,
        started_at: Instant,
    ) -> Result<DispatchOutcome, DispatchError> {
        let status = response.status();
        let raw = response.bytes().await.map_err(|err| {
            let (category, _) = classify_transport_error(&err);
            DispatchError::new(category, err.to_string())
        })?;
        let parsed: serde_json::Value =
            serde_json::from_slice(&raw).unwrap_or(serde_json::Value::Null);
        let external_task_id = parsed
            .get("id")
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string();
        if external_task_id.is_empty() {
            return Err(DispatchError::new(
                ErrorCategory::ParseError,
                "video submission response carries no job id",
            ));
        }

        // Freeze the billing rule at submission so later settlement is
        // immune to rule edits.
        let rule = self
            .storage
            .find_billing_rule(
                Some(candidate.model_id),
                Some(candidate.global_model_id),
                request.client_signature.task_type(),
            )
            .await?;
        let rule_snapshot = rule.and_then(|rule| serde_json::to_value(&rule).ok());

        let mut record = self.base_record(request, Some(candidate));
        record.status_code = status.as_u16() as i32;
        record.is_stream = false;
        record.response_time_ms = Some(started_at.elapsed().as_millis() as i64);
        self.storage.insert_pending_usage(&record).await?;

        self.storage
            .insert_video_task(NewVideoTask {
                request_id: request.request_id.clone(),
                external_task_id,
                provider_id: candidate.provider.id,
                endpoint_id: candidate.endpoint.id,
                credential_id: candidate.credential.id,
                model: candidate.upstream_model.clone(),
                poll_interval_seconds: self.config.video_poll_interval_seconds,
                max_poll_count: self.config.video_max_poll_count,
                rule_snapshot,
            })
            .await?;

        let latency_ms = started_at.elapsed().as_millis() as i64;
        let observed = guard.observed_concurrency;
        drop(guard);
        let _ = self
            .health
            .record_outcome(
                candidate.credential.id,
                Outcome {
                    ok: true,
                    tag: None,
                    latency_ms,
                    concurrency: observed,
                },
            )
            .await;
        let _ = self
            .storage
            .finish_candidate(&request.request_id, attempt_no, "selected", None, Some(latency_ms))
            .await;

        Ok(DispatchOutcome {
            status: status.as_u16(),
            content_type: "application/json",
            body: DispatchBody::Json(raw),
        })
    }

    fn clone_refs(&self) -> DispatcherRefs {
        DispatcherRefs {
            storage: self.storage.clone(),
            health: self.health.clone(),
            telemetry: self.telemetry.clone(),
            signatures: self.signatures.clone(),
            strict_billing: self.config.strict_billing,
        }
    }

    async fn append_ledger(
        &self,
        request: &ResolvedRequest,
        candidate: &Candidate,
        attempt_no: i32,
        status: &str,
        skip_reason: Option<&str>,
        error_category: Option<&str>,
    ) {
        let entry = CandidateLedgerEntry {
            request_id: request.request_id.clone(),
            attempt_no,
            provider_id: candidate.provider.id,
            endpoint_id: candidate.endpoint.id,
            credential_id: candidate.credential.id,
            status: status.to_string(),
            skip_reason: skip_reason.map(Into::into),
            error_category: error_category.map(Into::into),
            latency_ms: None,
            observed_concurrency: Some(self.health.in_flight(candidate.credential.id)),
        };
        if let Err(err) = self.storage.append_candidate(entry).await {
            warn!(error = %err, "candidate ledger append failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_failed_attempt(
        &self,
        request: &ResolvedRequest,
        candidate: &Candidate,
        attempt_no: i32,
        guard: &InFlightGuard,
        category: ErrorCategory,
        tag: FailureTag,
        started_at: Instant,
    ) {
        let latency_ms = started_at.elapsed().as_millis() as i64;
        let _ = self
            .storage
            .finish_candidate(
                &request.request_id,
                attempt_no,
                "failed",
                Some(category.as_str()),
                Some(latency_ms),
            )
            .await;
        let _ = self
            .health
            .record_outcome(
                candidate.credential.id,
                Outcome {
                    ok: false,
                    tag: Some(tag),
                    latency_ms,
                    concurrency: guard.observed_concurrency,
                },
            )
            .await;
    }

    /// Exactly one terminal telemetry event per logical request.
    async fn record_failure(&self, request: &ResolvedRequest, err: &DispatchError) {
        let mut record = self.base_record(request, None);
        record.status_code = err.http_status() as i32;
        record.error_code = Some(err.category.as_str().to_string());
        record.error_message = Some(err.message.clone());
        if let Err(write_err) = self.telemetry.record_failure(record).await {
            warn!(error = %write_err, "failure telemetry write failed");
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn settle_success(
        &self,
        request: &ResolvedRequest,
        candidate: &Candidate,
        attempt_no: i32,
        usage: TokenUsage,
        latency_ms: i64,
        first_byte_ms: Option<i64>,
        observed_concurrency: i32,
        status_code: u16,
        response_body: Option<serde_json::Value>,
    ) {
        let refs = self.clone_refs();
        settle_success_inner(
            &refs,
            request,
            candidate,
            attempt_no,
            usage,
            latency_ms,
            first_byte_ms,
            observed_concurrency,
            status_code,
            response_body,
            request.is_stream,
        )
        .await;
    }

    fn base_record(
        &self,
        request: &ResolvedRequest,
        candidate: Option<&Candidate>,
    ) -> UsageRecordInput {
        base_record(request, candidate)
    }
}

/// The subset of dispatcher state a detached stream forwarder needs.
#[derive(Clone)]
struct DispatcherRefs {
    storage: GatewayStorage,
    health: Arc<HealthManager>,
    telemetry: Arc<dyn TelemetryWriter>,
    signatures: Arc<ThoughtSignatureCache>,
    strict_billing: bool,
}

fn base_record(request: &ResolvedRequest, candidate: Option<&Candidate>) -> UsageRecordInput {
    let mut record = UsageRecordInput {
        request_id: request.request_id.clone(),
        user_id: request.user.as_ref().map(|user| user.id),
        api_key_id: Some(request.api_key.id),
        provider: candidate
            .map(|c| c.provider.name.clone())
            .unwrap_or_else(|| "unknown".to_string()),
        model: request.requested_model.clone(),
        request_type: request.client_signature.task_type().as_str().to_string(),
        api_format: Some(request.client_signature.key()),
        api_family: Some(request.client_signature.family.as_str().to_string()),
        endpoint_kind: Some(request.client_signature.kind.as_str().to_string()),
        is_stream: request.is_stream,
        status_code: 200,
        metadata: request.metadata.clone(),
        request_body: Some(request.body.clone()),
        ..Default::default()
    };
    if let Some(candidate) = candidate {
        record.provider_id = Some(candidate.provider.id);
        record.provider_endpoint_id = Some(candidate.endpoint.id);
        record.provider_api_key_id = Some(candidate.credential.id);
        record.target_model = Some(candidate.upstream_model.clone());
        record.endpoint_api_format = Some(candidate.upstream_signature.key());
        record.has_format_conversion = request.client_signature != candidate.upstream_signature;
    }
    record
}

fn proxy_url(candidate: &Candidate) -> Option<String> {
    let from_json = |value: &serde_json::Value| -> Option<String> {
        value
            .get("url")
            .and_then(|url| url.as_str())
            .map(str::to_string)
    };
    candidate
        .endpoint
        .proxy
        .as_ref()
        .and_then(from_json)
        .or_else(|| candidate.provider.proxy.as_ref().and_then(from_json))
}

/// Body `model` handling: openai/claude bodies carry the upstream name; the
/// gemini family carries the model in the URL only.
fn rewrite_model_field(
    body: &mut serde_json::Value,
    candidate: &Candidate,
    upstream_streams: bool,
    client_wants_stream: bool,
) {
    let serde_json::Value::Object(map) = body else {
        return;
    };
    match candidate.upstream_signature.family {
        ApiFamily::Gemini => {
            map.remove("model");
            map.remove("stream");
        }
        _ => {
            map.insert(
                "model".to_string(),
                serde_json::Value::String(candidate.upstream_model.clone()),
            );
            if upstream_streams && !client_wants_stream {
                map.insert("stream".to_string(), serde_json::Value::Bool(true));
            }
        }
    }
}

fn extract_body_usage(signature: EndpointSignature, body: &serde_json::Value) -> TokenUsage {
    match signature.family {
        // The Responses surface renames the usage keys; decoding it as chat
        // usage would silently zero every count.
        ApiFamily::OpenAI if signature.kind == EndpointKind::Cli => body
            .get("usage")
            .and_then(|usage| {
                serde_json::from_value::<omnigate_protocol::openai::ResponsesUsage>(usage.clone())
                    .ok()
            })
            .map(|usage| TokenUsage::from(&usage))
            .unwrap_or_default(),
        ApiFamily::OpenAI => body
            .get("usage")
            .and_then(|usage| {
                serde_json::from_value::<omnigate_protocol::openai::CompletionUsage>(usage.clone())
                    .ok()
            })
            .map(|usage| TokenUsage::from(&usage))
            .unwrap_or_default(),
        ApiFamily::Claude => body
            .get("usage")
            .and_then(|usage| {
                serde_json::from_value::<omnigate_protocol::claude::Usage>(usage.clone()).ok()
            })
            .map(|usage| TokenUsage::from(&usage))
            .unwrap_or_default(),
        ApiFamily::Gemini => body
            .get("usageMetadata")
            .and_then(|usage| {
                serde_json::from_value::<omnigate_protocol::gemini::UsageMetadata>(usage.clone())
                    .ok()
            })
            .map(|usage| TokenUsage::from(&usage))
            .unwrap_or_default(),
    }
}

fn pricing_for(candidate: &Candidate) -> TieredPricing {
    serde_json::from_value(candidate.pricing.clone()).unwrap_or_default()
}

#[allow(clippy::too_many_arguments)]
async fn settle_success_inner(
    refs: &DispatcherRefs,
    request: &ResolvedRequest,
    candidate: &Candidate,
    attempt_no: i32,
    usage: TokenUsage,
    latency_ms: i64,
    first_byte_ms: Option<i64>,
    observed_concurrency: i32,
    status_code: u16,
    response_body: Option<serde_json::Value>,
    is_stream: bool,
) {
    // Cost: a configured billing rule wins; otherwise tiered token pricing.
    let task_type = request.client_signature.task_type();
    let rule = refs
        .storage
        .find_billing_rule(
            Some(candidate.model_id),
            Some(candidate.global_model_id),
            task_type,
        )
        .await
        .ok()
        .flatten();

    let pricing = pricing_for(candidate);
    let breakdown = compute_token_cost(&usage, &pricing);
    let mut total_cost = breakdown.total();

    if let Some(rule) = rule {
        let engine = FormulaEngine::new();
        let mut variables: std::collections::HashMap<String, BindingValue> = rule
            .constants
            .iter()
            .map(|(name, value)| (name.clone(), BindingValue::Num(*value)))
            .collect();
        variables.insert("input_tokens".into(), BindingValue::Num(usage.input_tokens as f64));
        variables.insert(
            "output_tokens".into(),
            BindingValue::Num(usage.output_tokens as f64),
        );
        let dims = std::collections::HashMap::new();
        if let Ok(outcome) = engine.evaluate(
            &rule.expression,
            &variables,
            &dims,
            &rule.dimension_mappings,
            refs.strict_billing,
        ) {
            total_cost = outcome.cost;
        }
    }

    let mut record = base_record(request, Some(candidate));
    record.input_tokens = usage.input_tokens;
    record.output_tokens = usage.output_tokens;
    record.cache_creation_input_tokens = usage.cache_creation_tokens;
    record.cache_creation_input_tokens_5m = usage.cache_creation_tokens_5m;
    record.cache_creation_input_tokens_1h = usage.cache_creation_tokens_1h;
    record.cache_read_input_tokens = usage.cache_read_tokens;
    record.input_cost_usd = breakdown.input_cost;
    record.output_cost_usd = breakdown.output_cost;
    record.cache_creation_cost_usd = breakdown.cache_creation_cost;
    record.cache_read_cost_usd = breakdown.cache_read_cost;
    record.per_request_cost_usd = breakdown.per_request_cost;
    record.total_cost_usd = total_cost;
    record.status_code = status_code as i32;
    record.response_time_ms = Some(latency_ms);
    record.first_byte_time_ms = first_byte_ms;
    record.is_stream = is_stream;
    record.response_body = response_body;
    record.billing_settled = true;

    if let Err(err) = refs.telemetry.record_success(record).await {
        warn!(error = %err, "success telemetry write failed");
    }
    let _ = refs
        .storage
        .finish_candidate(&request.request_id, attempt_no, "selected", None, Some(latency_ms))
        .await;
    let _ = refs
        .health
        .record_outcome(
            candidate.credential.id,
            Outcome {
                ok: true,
                tag: None,
                latency_ms,
                concurrency: observed_concurrency,
            },
        )
        .await;
    let _ = refs
        .storage
        .apply_cost(
            request.user.as_ref().map(|user| user.id),
            Some(request.api_key.id),
            Some(candidate.credential.id),
            Some(candidate.provider.id),
            total_cost,
        )
        .await;
}

/// Detached forwarder for one client stream.
struct StreamJob {
    dispatcher: DispatcherRefs,
    request: ResolvedRequest,
    candidate: Candidate,
    attempt_no: i32,
    guard: InFlightGuard,
    hook: Option<Arc<dyn VariantHook>>,
    converter: StreamConverter,
    force_rewrite: bool,
    smoother: Option<StreamSmoother>,
    client_wants_stream: bool,
    started_at: Instant,
    first_byte_ms: i64,
}

impl StreamJob {
    /// Forward frames to the client channel until the upstream ends or the
    /// client goes away.
    async fn run(
        mut self,
        first_chunk: Bytes,
        mut upstream: UpstreamByteStream,
        tx: mpsc::Sender<Bytes>,
    ) {
        let mut decoder = SseDecoder::new();
        let mut tracker =
            StreamAggregator::new(self.request.client_signature, &self.request.requested_model);
        let passthrough = self.converter.is_passthrough() && !self.force_rewrite;

        let mut cancelled = false;
        let mut chunk = Some(first_chunk);
        loop {
            let bytes = match chunk.take() {
                Some(bytes) => bytes,
                None => match upstream.next().await {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(err)) => {
                        warn!(error = %err, request_id = %self.request.request_id, "upstream stream error");
                        break;
                    }
                    None => break,
                },
            };

            if passthrough {
                // Byte pass-through: still decode a copy for usage tracking.
                for frame in decoder.feed(&bytes) {
                    tracker.push(&frame);
                }
                if tx.send(bytes).await.is_err() {
                    cancelled = true;
                    break;
                }
                continue;
            }

            for frame in decoder.feed(&bytes) {
                let frames = self.convert_frame(&frame);
                for out_frame in frames {
                    tracker.push(&out_frame);
                    if let Some(smoother) = &self.smoother {
                        let mut first = true;
                        for piece in smoother.split(&out_frame) {
                            if !first {
                                smoother.pace().await;
                            }
                            first = false;
                            if tx.send(piece.to_bytes()).await.is_err() {
                                cancelled = true;
                                break;
                            }
                        }
                    } else if tx.send(out_frame.to_bytes()).await.is_err() {
                        cancelled = true;
                    }
                    if cancelled {
                        break;
                    }
                }
                if cancelled {
                    break;
                }
            }
            if cancelled {
                break;
            }
        }

        if !cancelled && !passthrough {
            for frame in self.converter.finish() {
                tracker.push(&frame);
                if tx.send(frame.to_bytes()).await.is_err() {
                    cancelled = true;
                    break;
                }
            }
        }
        drop(tx);

        self.settle(tracker, cancelled).await;
    }

    /// Aggregate the whole stream into one client-family body (the
    /// stream-to-non-stream path).
    async fn run_to_body(
        mut self,
        first_chunk: Bytes,
        mut upstream: UpstreamByteStream,
    ) -> Result<Bytes, DispatchError> {
        let mut decoder = SseDecoder::new();
        let mut aggregator =
            StreamAggregator::new(self.request.client_signature, &self.request.requested_model);

        let mut chunk = Some(first_chunk);
        loop {
            let bytes = match chunk.take() {
                Some(bytes) => bytes,
                None => match upstream.next().await {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(err)) => {
                        return Err(DispatchError::new(
                            ErrorCategory::ParseError,
                            format!("upstream stream error: {err}"),
                        ));
                    }
                    None => break,
                },
            };
            for frame in decoder.feed(&bytes) {
                for out_frame in self.convert_frame(&frame) {
                    aggregator.push(&out_frame);
                }
            }
        }
        for frame in self.converter.finish() {
            aggregator.push(&frame);
        }

        let usage = aggregator.usage();
        let body = aggregator.into_body();
        let latency_ms = self.started_at.elapsed().as_millis() as i64;
        let observed = self.guard.observed_concurrency;
        settle_success_inner(
            &self.dispatcher,
            &self.request,
            &self.candidate,
            self.attempt_no,
            usage,
            latency_ms,
            Some(self.first_byte_ms),
            observed,
            200,
            Some(body.clone()),
            false,
        )
        .await;
        Ok(Bytes::from(body.to_string()))
    }

    fn convert_frame(&mut self, frame: &SseFrame) -> Vec<SseFrame> {
        // Envelope hooks unwrap each parsed event before conversion.
        let unwrapped = if self.force_rewrite
            && let Some(hook) = &self.hook
            && !frame.is_done_marker()
        {
            match serde_json::from_str::<serde_json::Value>(&frame.data) {
                Ok(value) => {
                    let inner = hook.unwrap_response(value);
                    if self.candidate.upstream_signature.family == ApiFamily::Gemini {
                        self.dispatcher
                            .signatures
                            .capture_from_response(&self.candidate.upstream_model, &inner);
                    }
                    SseFrame {
                        event: frame.event.clone(),
                        data: inner.to_string(),
                    }
                }
                Err(_) => frame.clone(),
            }
        } else {
            frame.clone()
        };
        self.converter.push(&unwrapped)
    }

    async fn settle(self, tracker: StreamAggregator, cancelled: bool) {
        let latency_ms = self.started_at.elapsed().as_millis() as i64;
        let observed = self.guard.observed_concurrency;
        let mut usage = tracker.usage();

        if cancelled {
            // Attribute partial cost: tokens from the terminal frames seen so
            // far; output estimated from forwarded content when absent.
            let body = tracker.into_body();
            if usage.output_tokens == 0 {
                let text_len = body["choices"][0]["message"]["content"]
                    .as_str()
                    .map(str::len)
                    .or_else(|| body["content"][0]["text"].as_str().map(str::len))
                    .or_else(|| {
                        body["output"][0]["content"][0]["text"].as_str().map(str::len)
                    })
                    .unwrap_or(0);
                usage.output_tokens = (text_len / 4) as i64;
            }
            let mut record = base_record(&self.request, Some(&self.candidate));
            record.input_tokens = usage.input_tokens;
            record.output_tokens = usage.output_tokens;
            record.cache_read_input_tokens = usage.cache_read_tokens;
            record.response_time_ms = Some(latency_ms);
            record.first_byte_time_ms = Some(self.first_byte_ms);
            record.error_code = Some(ErrorCategory::Cancelled.as_str().to_string());
            if let Err(err) = self.dispatcher.telemetry.record_cancelled(record).await {
                warn!(error = %err, "cancel telemetry write failed");
            }
            let _ = self
                .dispatcher
                .storage
                .finish_candidate(
                    &self.request.request_id,
                    self.attempt_no,
                    "failed",
                    Some(ErrorCategory::Cancelled.as_str()),
                    Some(latency_ms),
                )
                .await;
            let _ = self
                .dispatcher
                .health
                .record_outcome(
                    self.candidate.credential.id,
                    Outcome {
                        ok: true,
                        tag: None,
                        latency_ms,
                        concurrency: observed,
                    },
                )
                .await;
            return;
        }

        settle_success_inner(
            &self.dispatcher,
            &self.request,
            &self.candidate,
            self.attempt_no,
            usage,
            latency_ms,
            Some(self.first_byte_ms),
            observed,
            200,
            None,
            self.client_wants_stream,
        )
        .await;
    }
}
