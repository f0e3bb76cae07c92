//! Candidate ledger: the authoritative trace of what the planner did.

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveValue, EntityTrait, QueryFilter, QueryOrder};
use time::OffsetDateTime;

use crate::GatewayStorage;
use crate::entities::{self, request_candidates};

#[derive(Debug, Clone)]
pub struct CandidateLedgerEntry {
    pub request_id: String,
    pub attempt_no: i32,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub credential_id: i64,
    /// "selected" | "skipped" | "failed"
    pub status: String,
    pub skip_reason: Option<String>,
    pub error_category: Option<String>,
    pub latency_ms: Option<i64>,
    pub observed_concurrency: Option<i32>,
}

impl GatewayStorage {
    pub async fn append_candidate(&self, entry: CandidateLedgerEntry) -> Result<(), DbErr> {
        let active = request_candidates::ActiveModel {
            id: ActiveValue::NotSet,
            request_id: ActiveValue::Set(entry.request_id),
            attempt_no: ActiveValue::Set(entry.attempt_no),
            provider_id: ActiveValue::Set(entry.provider_id),
            endpoint_id: ActiveValue::Set(entry.endpoint_id),
            credential_id: ActiveValue::Set(entry.credential_id),
            status: ActiveValue::Set(entry.status),
            skip_reason: ActiveValue::Set(entry.skip_reason),
            error_category: ActiveValue::Set(entry.error_category),
            latency_ms: ActiveValue::Set(entry.latency_ms),
            observed_concurrency: ActiveValue::Set(entry.observed_concurrency),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        entities::RequestCandidates::insert(active)
            .exec(self.connection())
            .await?;
        Ok(())
    }

    /// Update the terminal outcome of the attempt recorded as `selected`.
    pub async fn finish_candidate(
        &self,
        request_id: &str,
        attempt_no: i32,
        status: &str,
        error_category: Option<&str>,
        latency_ms: Option<i64>,
    ) -> Result<(), DbErr> {
        use request_candidates::Column;
        let mut update = entities::RequestCandidates::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::LatencyMs, Expr::value(latency_ms));
        if let Some(category) = error_category {
            update = update.col_expr(Column::ErrorCategory, Expr::value(category));
        }
        update
            .filter(Column::RequestId.eq(request_id))
            .filter(Column::AttemptNo.eq(attempt_no))
            .exec(self.connection())
            .await?;
        Ok(())
    }

    pub async fn candidates_for_request(
        &self,
        request_id: &str,
    ) -> Result<Vec<request_candidates::Model>, DbErr> {
        entities::RequestCandidates::find()
            .filter(request_candidates::Column::RequestId.eq(request_id))
            .order_by_asc(request_candidates::Column::AttemptNo)
            .all(self.connection())
            .await
    }
}
