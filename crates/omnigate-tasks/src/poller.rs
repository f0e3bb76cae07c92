//! The async task poller: drives non-terminal video jobs to a terminal
//! status and settles them through the billing + telemetry pipeline.
//!
//! Each tick: advisory lock → select due jobs → for each job, three phases
//! so no DB connection is held across the HTTP poll: (1) prepare the
//! context in a short session, (2) poll upstream, (3) merge in a fresh
//! session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use omnigate_billing::{BillingRuleSnapshot, BindingValue, FormulaEngine, collect_dimensions};
use omnigate_common::{ApiFamily, EndpointKind, EndpointSignature, TaskType};
use omnigate_dispatch::client::ClientPool;
use omnigate_dispatch::transport::{build_headers, build_upstream_url};
use omnigate_storage::entities::video_tasks;
use omnigate_storage::{GatewayStorage, TerminalStatus};

use crate::lock::AdvisoryLock;
use crate::video::{PollDecision, backoff_delay, decide, is_permanent_poll_error};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub batch_size: u64,
    pub concurrency: usize,
    pub http_timeout: Duration,
    pub lock_key: String,
    pub lock_ttl_secs: u64,
    pub consecutive_failure_alert_threshold: u32,
    pub strict_billing: bool,
    /// Missing-required-dimension warnings fire past this hourly count.
    pub missing_dimension_alert_threshold: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            concurrency: 4,
            http_timeout: Duration::from_secs(15),
            lock_key: "omnigate:video-poller:lock".to_string(),
            lock_ttl_secs: 60,
            consecutive_failure_alert_threshold: 3,
            strict_billing: false,
            missing_dimension_alert_threshold: 10,
        }
    }
}

/// Per-job context prepared in phase 1; holds no DB connection.
struct PollContext {
    task: video_tasks::Model,
    url: String,
    headers: Vec<(String, String)>,
}

pub struct VideoTaskPoller {
    storage: GatewayStorage,
    clients: Arc<ClientPool>,
    lock: AdvisoryLock,
    config: PollerConfig,
    semaphore: Arc<Semaphore>,
    consecutive_failures: AtomicU32,
    /// (model, dimension) -> count within the current hour.
    missing_dimensions: std::sync::Mutex<HashMap<(String, String), (i64, u32)>>,
}

impl VideoTaskPoller {
    pub fn new(
        storage: GatewayStorage,
        clients: Arc<ClientPool>,
        redis: Option<redis::aio::ConnectionManager>,
        config: PollerConfig,
    ) -> Self {
        let lock = AdvisoryLock::new(redis, config.lock_key.clone(), config.lock_ttl_secs);
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        Self {
            storage,
            clients,
            lock,
            config,
            semaphore,
            consecutive_failures: AtomicU32::new(0),
            missing_dimensions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// One scheduler tick.
    pub async fn tick(self: &Arc<Self>) {
        let Some(token) = self.lock.acquire().await else {
            return;
        };

        let outcome = self.run_batch().await;
        self.lock.release(token).await;

        match outcome {
            BatchOutcome::Empty => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            BatchOutcome::SomeSucceeded => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
            }
            BatchOutcome::AllFailed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.consecutive_failure_alert_threshold {
                    error!(
                        consecutive_batches = failures,
                        "video poller: consecutive batches fully failed"
                    );
                }
            }
        }
    }

    async fn run_batch(self: &Arc<Self>) -> BatchOutcome {
        let now = OffsetDateTime::now_utc();
        let ids = match self
            .storage
            .list_due_video_tasks(now, self.config.batch_size)
            .await
        {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "video poller: due-task query failed");
                return BatchOutcome::AllFailed;
            }
        };
        if ids.is_empty() {
            return BatchOutcome::Empty;
        }

        let mut handles = Vec::with_capacity(ids.len());
        for task_id in ids {
            let poller = self.clone();
            let semaphore = self.semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.ok()?;
                Some(poller.poll_one(task_id).await)
            }));
        }

        let mut any_ok = false;
        let mut any = false;
        for handle in handles {
            if let Ok(Some(ok)) = handle.await {
                any = true;
                any_ok |= ok;
            }
        }
        if !any || any_ok {
            BatchOutcome::SomeSucceeded
        } else {
            BatchOutcome::AllFailed
        }
    }

    /// Returns false only on unexpected internal failure (alerting input).
    async fn poll_one(&self, task_id: i64) -> bool {
        // Phase 1: prepare (short-lived DB reads).
        let context = match self.prepare(task_id).await {
            Ok(Some(context)) => context,
            Ok(None) => return true,
            Err(err) => {
                warn!(task_id, error = %err, "video poller: prepare failed");
                return false;
            }
        };

        // Phase 2: HTTP poll with no DB connection held.
        let poll = self.poll_http(&context).await;

        // Phase 3: merge the result in a fresh session.
        match self.merge(context, poll).await {
            Ok(()) => true,
            Err(err) => {
                warn!(task_id, error = %err, "video poller: merge failed");
                false
            }
        }
    }

    async fn prepare(&self, task_id: i64) -> Result<Option<PollContext>, sea_orm::DbErr> {
        let Some(task) = self.storage.get_video_task(task_id).await? else {
            warn!(task_id, "video task disappeared during poll");
            return Ok(None);
        };
        if task.status == "completed" || task.status == "failed" {
            return Ok(None);
        }

        // Poll budget exhausted without a terminal status.
        if task.poll_count >= task.max_poll_count {
            self.storage
                .finish_video_task(
                    task.id,
                    "failed",
                    None,
                    None,
                    Some("poll_timeout".to_string()),
                    Some("poll budget exhausted before terminal status".to_string()),
                    None,
                )
                .await?;
            self.settle(&task, SettleInput::timeout()).await;
            return Ok(None);
        }

        use sea_orm::EntityTrait;
        let Some(endpoint) = omnigate_storage::entities::ProviderEndpoints::find_by_id(task.endpoint_id)
            .one(self.storage.connection())
            .await?
        else {
            self.storage
                .finish_video_task(
                    task.id,
                    "failed",
                    None,
                    None,
                    Some("endpoint_missing".to_string()),
                    Some("provider endpoint was deleted".to_string()),
                    None,
                )
                .await?;
            self.settle(&task, SettleInput::config_error("endpoint_missing")).await;
            return Ok(None);
        };
        let Some(credential) = self.storage.load_credential(task.credential_id).await? else {
            self.storage
                .finish_video_task(
                    task.id,
                    "failed",
                    None,
                    None,
                    Some("credential_missing".to_string()),
                    Some("provider credential was deleted".to_string()),
                    None,
                )
                .await?;
            self.settle(&task, SettleInput::config_error("credential_missing")).await;
            return Ok(None);
        };

        let signature = EndpointSignature::new(
            endpoint.api_family.parse().unwrap_or(ApiFamily::OpenAI),
            endpoint.endpoint_kind.parse().unwrap_or(EndpointKind::Video),
        );
        let base = build_upstream_url(
            &endpoint,
            &credential,
            signature,
            None,
            &task.model,
            false,
            None,
        )
        .map_err(|err| sea_orm::DbErr::Custom(err.to_string()))?;
        let url = format!("{base}/{}", task.external_task_id);
        let headers = build_headers(&endpoint, &credential, signature);

        Ok(Some(PollContext { task, url, headers }))
    }

    async fn poll_http(&self, context: &PollContext) -> PollDecision {
        let client = match self.clients.client_for(None, None) {
            Ok(client) => client,
            Err(err) => {
                return PollDecision::Transient {
                    error_message: err.to_string(),
                };
            }
        };
        let mut builder = client.get(&context.url).timeout(self.config.http_timeout);
        for (name, value) in &context.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let body: serde_json::Value = response
                    .bytes()
                    .await
                    .ok()
                    .and_then(|bytes| serde_json::from_slice(&bytes).ok())
                    .unwrap_or(serde_json::Value::Null);
                decide(status, &body)
            }
            Err(err) => {
                let message = err.to_string();
                if is_permanent_poll_error(None, &message) {
                    PollDecision::Failed {
                        error_code: "poll_error".to_string(),
                        error_message: message,
                    }
                } else {
                    PollDecision::Transient { error_message: message }
                }
            }
        }
    }

    async fn merge(
        &self,
        context: PollContext,
        decision: PollDecision,
    ) -> Result<(), sea_orm::DbErr> {
        let task = &context.task;
        match decision {
            PollDecision::StillRunning { progress } => {
                let next = OffsetDateTime::now_utc()
                    + time::Duration::seconds(task.poll_interval_seconds);
                self.storage
                    .reschedule_video_task(task.id, progress, task.retry_count, next)
                    .await?;
            }
            PollDecision::Transient { error_message } => {
                let retry_count = task.retry_count + 1;
                let delay = backoff_delay(task.poll_interval_seconds, task.retry_count);
                info!(
                    task_id = task.id,
                    retry_count, delay, error = %error_message,
                    "video poll transient failure, backing off"
                );
                let next = OffsetDateTime::now_utc() + time::Duration::seconds(delay);
                self.storage
                    .reschedule_video_task(task.id, task.progress, retry_count, next)
                    .await?;
            }
            PollDecision::Completed { urls, expires_at_unix } => {
                let raw = serde_json::json!({"urls": urls});
                let expires_at = expires_at_unix
                    .and_then(|unix| OffsetDateTime::from_unix_timestamp(unix).ok());
                self.storage
                    .finish_video_task(
                        task.id,
                        "completed",
                        Some(serde_json::json!(urls)),
                        expires_at,
                        None,
                        None,
                        Some(raw.clone()),
                    )
                    .await?;
                self.settle(task, SettleInput::completed(raw)).await;
            }
            PollDecision::Failed { error_code, error_message } => {
                self.storage
                    .finish_video_task(
                        task.id,
                        "failed",
                        None,
                        None,
                        Some(error_code.clone()),
                        Some(error_message.clone()),
                        None,
                    )
                    .await?;
                self.settle(task, SettleInput::failed(error_code)).await;
            }
        }
        Ok(())
    }

    /// Terminal settlement: dimensions → billing rule → usage row.
    async fn settle(&self, task: &video_tasks::Model, input: SettleInput) {
        let usage_row = match self
            .storage
            .find_usage_by_request_id(&task.request_id)
            .await
        {
            Ok(Some(row)) => row,
            Ok(None) => {
                warn!(request_id = %task.request_id, "no usage row for video task");
                return;
            }
            Err(err) => {
                warn!(error = %err, "usage lookup failed during settlement");
                return;
            }
        };

        let (status, error_code, cost) = match &input.kind {
            SettleKind::Completed(raw) => {
                let cost = self.compute_cost(task, &usage_row, raw).await;
                match cost {
                    Ok(cost) => (TerminalStatus::Completed, None, cost),
                    Err(missing) => {
                        // Strict billing: fail the job and hide its artifact.
                        warn!(
                            request_id = %task.request_id,
                            ?missing,
                            "billing incomplete, failing video task"
                        );
                        (TerminalStatus::Failed, Some("billing_incomplete"), 0.0)
                    }
                }
            }
            SettleKind::Failed(code) => (TerminalStatus::Failed, Some(code.as_str()), 0.0),
        };

        if let Err(err) = self
            .storage
            .settle_usage(
                &task.request_id,
                status,
                cost,
                error_code,
                input.raw_response(),
            )
            .await
        {
            warn!(error = %err, "usage settlement failed");
        }
        if cost > 0.0 {
            let _ = self
                .storage
                .apply_cost(
                    usage_row.user_id,
                    usage_row.api_key_id,
                    Some(task.credential_id),
                    Some(task.provider_id),
                    cost,
                )
                .await;
        }
    }

    /// Evaluate the frozen rule snapshot (or a fresh lookup when absent)
    /// over collected dimensions. Err carries the missing-required list.
    async fn compute_cost(
        &self,
        task: &video_tasks::Model,
        usage_row: &omnigate_storage::entities::usage_records::Model,
        raw_response: &serde_json::Value,
    ) -> Result<f64, Vec<String>> {
        let rule: Option<BillingRuleSnapshot> = task
            .rule_snapshot
            .as_ref()
            .and_then(|json| serde_json::from_value(json.clone()).ok());
        let rule = match rule {
            Some(rule) => Some(rule),
            None => self
                .storage
                .find_billing_rule(None, None, TaskType::Video)
                .await
                .ok()
                .flatten(),
        };
        let Some(rule) = rule else {
            return Ok(0.0);
        };

        let signature = EndpointSignature::new(ApiFamily::OpenAI, EndpointKind::Video);
        let collectors = self
            .storage
            .load_collectors(signature, TaskType::Video)
            .await
            .unwrap_or_default();
        let request_body = usage_row.request_body.clone().unwrap_or(serde_json::Value::Null);
        let dims = collect_dimensions(
            &collectors,
            omnigate_billing::CollectInput {
                request: Some(&request_body),
                response: Some(raw_response),
                metadata: usage_row.metadata.as_ref(),
            },
            &HashMap::new(),
        );

        let variables: HashMap<String, BindingValue> = rule
            .constants
            .iter()
            .map(|(name, value)| (name.clone(), BindingValue::Num(*value)))
            .collect();
        let engine = FormulaEngine::new();
        match engine.evaluate(
            &rule.expression,
            &variables,
            &dims,
            &rule.dimension_mappings,
            self.config.strict_billing,
        ) {
            Ok(outcome) => {
                if !outcome.missing_required.is_empty() {
                    self.note_missing_dimensions(&task.model, &outcome.missing_required);
                }
                Ok(outcome.cost)
            }
            Err(omnigate_billing::BillingError::Incomplete { missing_required }) => {
                self.note_missing_dimensions(&task.model, &missing_required);
                Err(missing_required)
            }
            Err(err) => {
                warn!(error = %err, "billing expression failed during settlement");
                Ok(0.0)
            }
        }
    }

    /// Hourly per-(model, dimension) counter; warn past the threshold.
    fn note_missing_dimensions(&self, model: &str, missing: &[String]) {
        let hour = OffsetDateTime::now_utc().unix_timestamp() / 3600;
        let mut counters = self
            .missing_dimensions
            .lock()
            .expect("missing-dimension counter poisoned");
        for dimension in missing {
            let entry = counters
                .entry((model.to_string(), dimension.clone()))
                .or_insert((hour, 0));
            if entry.0 != hour {
                *entry = (hour, 0);
            }
            entry.1 += 1;
            if entry.1 >= self.config.missing_dimension_alert_threshold {
                warn!(
                    model,
                    dimension = %dimension,
                    count_this_hour = entry.1,
                    "required billing dimension repeatedly missing"
                );
            }
        }
    }
}

enum BatchOutcome {
    Empty,
    SomeSucceeded,
    AllFailed,
}

enum SettleKind {
    Completed(serde_json::Value),
    Failed(String),
}

struct SettleInput {
    kind: SettleKind,
}

impl SettleInput {
    fn completed(raw: serde_json::Value) -> Self {
        Self {
            kind: SettleKind::Completed(raw),
        }
    }

    fn failed(code: String) -> Self {
        Self {
            kind: SettleKind::Failed(code),
        }
    }

    fn timeout() -> Self {
        Self::failed("poll_timeout".to_string())
    }

    fn config_error(code: &str) -> Self {
        Self::failed(code.to_string())
    }

    fn raw_response(&self) -> Option<serde_json::Value> {
        match &self.kind {
            SettleKind::Completed(raw) => Some(raw.clone()),
            SettleKind::Failed(_) => None,
        }
    }
}
