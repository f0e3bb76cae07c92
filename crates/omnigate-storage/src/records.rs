//! Usage row persistence: streaming updates, terminal bulk upserts, and
//! settlement. One row per request_id; duplicate inserts are success.

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ActiveValue, EntityTrait, QueryFilter};
use time::OffsetDateTime;
use tracing::warn;

use crate::GatewayStorage;
use crate::entities::{self, usage_records};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Completed,
    Failed,
    Cancelled,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::Failed => "failed",
            TerminalStatus::Cancelled => "cancelled",
        }
    }
}

/// Field set carried by one terminal usage event. Also the queue payload:
/// the queue writer serialises it, the consumer deserialises it.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct UsageRecordInput {
    pub request_id: String,
    pub user_id: Option<i64>,
    pub api_key_id: Option<i64>,
    pub provider_id: Option<i64>,
    pub provider_endpoint_id: Option<i64>,
    pub provider_api_key_id: Option<i64>,
    pub provider: String,
    pub model: String,
    pub target_model: Option<String>,
    pub api_format: Option<String>,
    pub api_family: Option<String>,
    pub endpoint_kind: Option<String>,
    pub endpoint_api_format: Option<String>,
    pub has_format_conversion: bool,
    pub request_type: String,
    pub is_stream: bool,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub cache_creation_input_tokens_5m: i64,
    pub cache_creation_input_tokens_1h: i64,
    pub cache_read_input_tokens: i64,
    pub input_cost_usd: f64,
    pub output_cost_usd: f64,
    pub cache_creation_cost_usd: f64,
    pub cache_read_cost_usd: f64,
    pub per_request_cost_usd: f64,
    pub total_cost_usd: f64,
    pub actual_cost_usd: Option<f64>,
    pub status_code: i32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub first_byte_time_ms: Option<i64>,
    pub request_headers: Option<Json>,
    pub request_body: Option<Json>,
    pub provider_request_headers: Option<Json>,
    pub provider_request_body: Option<Json>,
    pub response_headers: Option<Json>,
    pub response_body: Option<Json>,
    pub client_response_headers: Option<Json>,
    pub client_response_body: Option<Json>,
    pub metadata: Option<Json>,
    pub billing_settled: bool,
}

fn terminal_active_model(
    input: &UsageRecordInput,
    status: TerminalStatus,
    now: OffsetDateTime,
) -> usage_records::ActiveModel {
    usage_records::ActiveModel {
        id: ActiveValue::NotSet,
        request_id: ActiveValue::Set(input.request_id.clone()),
        user_id: ActiveValue::Set(input.user_id),
        api_key_id: ActiveValue::Set(input.api_key_id),
        provider_id: ActiveValue::Set(input.provider_id),
        provider_endpoint_id: ActiveValue::Set(input.provider_endpoint_id),
        provider_api_key_id: ActiveValue::Set(input.provider_api_key_id),
        provider: ActiveValue::Set(input.provider.clone()),
        model: ActiveValue::Set(input.model.clone()),
        target_model: ActiveValue::Set(input.target_model.clone()),
        api_format: ActiveValue::Set(input.api_format.clone()),
        api_family: ActiveValue::Set(input.api_family.clone()),
        endpoint_kind: ActiveValue::Set(input.endpoint_kind.clone()),
        endpoint_api_format: ActiveValue::Set(input.endpoint_api_format.clone()),
        has_format_conversion: ActiveValue::Set(input.has_format_conversion),
        request_type: ActiveValue::Set(input.request_type.clone()),
        is_stream: ActiveValue::Set(input.is_stream),
        input_tokens: ActiveValue::Set(input.input_tokens),
        output_tokens: ActiveValue::Set(input.output_tokens),
        cache_creation_input_tokens: ActiveValue::Set(input.cache_creation_input_tokens),
        cache_creation_input_tokens_5m: ActiveValue::Set(input.cache_creation_input_tokens_5m),
        cache_creation_input_tokens_1h: ActiveValue::Set(input.cache_creation_input_tokens_1h),
        cache_read_input_tokens: ActiveValue::Set(input.cache_read_input_tokens),
        input_cost_usd: ActiveValue::Set(input.input_cost_usd),
        output_cost_usd: ActiveValue::Set(input.output_cost_usd),
        cache_creation_cost_usd: ActiveValue::Set(input.cache_creation_cost_usd),
        cache_read_cost_usd: ActiveValue::Set(input.cache_read_cost_usd),
        per_request_cost_usd: ActiveValue::Set(input.per_request_cost_usd),
        total_cost_usd: ActiveValue::Set(input.total_cost_usd),
        actual_cost_usd: ActiveValue::Set(input.actual_cost_usd),
        status_code: ActiveValue::Set(input.status_code),
        status: ActiveValue::Set(status.as_str().to_string()),
        billing_status: ActiveValue::Set(
            if input.billing_settled { "settled" } else { "pending" }.to_string(),
        ),
        error_code: ActiveValue::Set(input.error_code.clone()),
        error_message: ActiveValue::Set(input.error_message.clone()),
        response_time_ms: ActiveValue::Set(input.response_time_ms),
        first_byte_time_ms: ActiveValue::Set(input.first_byte_time_ms),
        request_headers: ActiveValue::Set(input.request_headers.clone()),
        request_body: ActiveValue::Set(input.request_body.clone()),
        provider_request_headers: ActiveValue::Set(input.provider_request_headers.clone()),
        provider_request_body: ActiveValue::Set(input.provider_request_body.clone()),
        response_headers: ActiveValue::Set(input.response_headers.clone()),
        response_body: ActiveValue::Set(input.response_body.clone()),
        client_response_headers: ActiveValue::Set(input.client_response_headers.clone()),
        client_response_body: ActiveValue::Set(input.client_response_body.clone()),
        request_body_compressed: ActiveValue::Set(None),
        response_body_compressed: ActiveValue::Set(None),
        metadata: ActiveValue::Set(input.metadata.clone()),
        created_at: ActiveValue::Set(now),
        updated_at: ActiveValue::Set(now),
        ..Default::default()
    }
}

fn terminal_update_columns() -> Vec<usage_records::Column> {
    use usage_records::Column;
    vec![
        Column::ProviderId,
        Column::ProviderEndpointId,
        Column::ProviderApiKeyId,
        Column::Provider,
        Column::Model,
        Column::TargetModel,
        Column::ApiFormat,
        Column::ApiFamily,
        Column::EndpointKind,
        Column::EndpointApiFormat,
        Column::HasFormatConversion,
        Column::RequestType,
        Column::IsStream,
        Column::InputTokens,
        Column::OutputTokens,
        Column::CacheCreationInputTokens,
        Column::CacheCreationInputTokens5m,
        Column::CacheCreationInputTokens1h,
        Column::CacheReadInputTokens,
        Column::InputCostUsd,
        Column::OutputCostUsd,
        Column::CacheCreationCostUsd,
        Column::CacheReadCostUsd,
        Column::PerRequestCostUsd,
        Column::TotalCostUsd,
        Column::ActualCostUsd,
        Column::StatusCode,
        Column::Status,
        Column::BillingStatus,
        Column::ErrorCode,
        Column::ErrorMessage,
        Column::ResponseTimeMs,
        Column::FirstByteTimeMs,
        Column::ResponseHeaders,
        Column::ResponseBody,
        Column::ClientResponseHeaders,
        Column::ClientResponseBody,
        Column::Metadata,
        Column::UpdatedAt,
    ]
}

impl GatewayStorage {
    /// Insert a `pending` row at submission time (async jobs).
    pub async fn insert_pending_usage(
        &self,
        input: &UsageRecordInput,
    ) -> Result<(), DbErr> {
        let now = OffsetDateTime::now_utc();
        let mut active = terminal_active_model(input, TerminalStatus::Completed, now);
        active.status = ActiveValue::Set("pending".to_string());
        active.billing_status = ActiveValue::Set("pending".to_string());
        let insert = entities::UsageRecords::insert(active)
            .on_conflict(
                OnConflict::column(usage_records::Column::RequestId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec(self.connection())
            .await;
        match insert {
            Ok(_) | Err(DbErr::RecordNotInserted) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// First-byte observed: flip `pending → streaming` and record the timing.
    pub async fn apply_streaming_event(
        &self,
        request_id: &str,
        first_byte_time_ms: i64,
    ) -> Result<(), DbErr> {
        use usage_records::Column;
        entities::UsageRecords::update_many()
            .col_expr(Column::Status, Expr::value("streaming"))
            .col_expr(Column::FirstByteTimeMs, Expr::value(first_byte_time_ms))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::RequestId.eq(request_id))
            .filter(Column::Status.is_in(["pending", "streaming"]))
            .exec(self.connection())
            .await?;
        Ok(())
    }

    /// Bulk-apply a batch of terminal events: new request_ids inserted,
    /// existing rows updated in place. Falls back to per-row application
    /// when the bulk statement conflicts.
    pub async fn upsert_terminal_batch(
        &self,
        batch: &[(UsageRecordInput, TerminalStatus)],
    ) -> Result<(), DbErr> {
        if batch.is_empty() {
            return Ok(());
        }
        let now = OffsetDateTime::now_utc();
        let models = batch
            .iter()
            .map(|(input, status)| terminal_active_model(input, *status, now));

        let bulk = entities::UsageRecords::insert_many(models)
            .on_conflict(
                OnConflict::column(usage_records::Column::RequestId)
                    .update_columns(terminal_update_columns())
                    .to_owned(),
            )
            .exec(self.connection())
            .await;

        match bulk {
            Ok(_) => Ok(()),
            Err(err) => {
                warn!(error = %err, "bulk usage upsert failed, falling back to per-row");
                for (input, status) in batch {
                    self.upsert_terminal_one(input, *status).await?;
                }
                Ok(())
            }
        }
    }

    pub async fn upsert_terminal_one(
        &self,
        input: &UsageRecordInput,
        status: TerminalStatus,
    ) -> Result<(), DbErr> {
        let now = OffsetDateTime::now_utc();
        let active = terminal_active_model(input, status, now);
        let result = entities::UsageRecords::insert(active)
            .on_conflict(
                OnConflict::column(usage_records::Column::RequestId)
                    .update_columns(terminal_update_columns())
                    .to_owned(),
            )
            .exec(self.connection())
            .await;
        match result {
            Ok(_) | Err(DbErr::RecordNotInserted) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Flip billing to settled with the final cost breakdown. Settled rows
    /// never change again.
    pub async fn settle_usage(
        &self,
        request_id: &str,
        status: TerminalStatus,
        total_cost_usd: f64,
        error_code: Option<&str>,
        response_body: Option<Json>,
    ) -> Result<(), DbErr> {
        use usage_records::Column;
        let mut update = entities::UsageRecords::update_many()
            .col_expr(Column::Status, Expr::value(status.as_str()))
            .col_expr(Column::BillingStatus, Expr::value("settled"))
            .col_expr(Column::TotalCostUsd, Expr::value(total_cost_usd))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()));
        if let Some(code) = error_code {
            update = update.col_expr(Column::ErrorCode, Expr::value(code));
        }
        if let Some(body) = response_body {
            update = update.col_expr(Column::ResponseBody, Expr::value(body));
        }
        update
            .filter(Column::RequestId.eq(request_id))
            .filter(Column::BillingStatus.eq("pending"))
            .exec(self.connection())
            .await?;
        Ok(())
    }

    pub async fn find_usage_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<usage_records::Model>, DbErr> {
        entities::UsageRecords::find()
            .filter(usage_records::Column::RequestId.eq(request_id))
            .one(self.connection())
            .await
    }
}
