//! Daily usage aggregation with bounded misfire backfill.

use std::collections::HashMap;

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ActiveValue, EntityTrait, QueryFilter};
use time::{Date, OffsetDateTime, Time};
use tracing::info;

use crate::GatewayStorage;
use crate::entities::{self, stats_daily, usage_records};

#[derive(Debug, Default, Clone)]
struct DayBucket {
    request_count: i64,
    success_count: i64,
    error_count: i64,
    error_breakdown: HashMap<String, i64>,
    input_tokens: i64,
    output_tokens: i64,
    total_cost_usd: f64,
}

impl GatewayStorage {
    /// Aggregate one day of usage into `stats_daily`, replacing any prior
    /// rows for that day (idempotent re-runs).
    pub async fn aggregate_day(&self, day: Date, mark_complete: bool) -> Result<(), DbErr> {
        use usage_records::Column;
        let start = day.with_time(Time::MIDNIGHT).assume_utc();
        let end = start + time::Duration::days(1);

        let rows = entities::UsageRecords::find()
            .filter(Column::CreatedAt.gte(start))
            .filter(Column::CreatedAt.lt(end))
            .all(self.connection())
            .await?;

        let mut buckets: HashMap<(String, String), DayBucket> = HashMap::new();
        for row in rows {
            let bucket = buckets
                .entry((row.provider.clone(), row.model.clone()))
                .or_default();
            bucket.request_count += 1;
            if row.status == "completed" {
                bucket.success_count += 1;
            } else if row.status == "failed" {
                bucket.error_count += 1;
                let category = row
                    .error_code
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string());
                *bucket.error_breakdown.entry(category).or_default() += 1;
            }
            bucket.input_tokens += row.input_tokens;
            bucket.output_tokens += row.output_tokens;
            bucket.total_cost_usd += row.total_cost_usd;
        }

        let now = OffsetDateTime::now_utc();
        for ((provider, model), bucket) in buckets {
            let active = stats_daily::ActiveModel {
                id: ActiveValue::NotSet,
                day: ActiveValue::Set(day),
                provider: ActiveValue::Set(provider),
                model: ActiveValue::Set(model),
                request_count: ActiveValue::Set(bucket.request_count),
                success_count: ActiveValue::Set(bucket.success_count),
                error_count: ActiveValue::Set(bucket.error_count),
                error_breakdown: ActiveValue::Set(
                    serde_json::to_value(&bucket.error_breakdown).ok(),
                ),
                input_tokens: ActiveValue::Set(bucket.input_tokens),
                output_tokens: ActiveValue::Set(bucket.output_tokens),
                total_cost_usd: ActiveValue::Set(bucket.total_cost_usd),
                complete: ActiveValue::Set(mark_complete),
                created_at: ActiveValue::Set(now),
                updated_at: ActiveValue::Set(now),
                ..Default::default()
            };
            entities::StatsDaily::insert(active)
                .on_conflict(
                    OnConflict::columns([
                        stats_daily::Column::Day,
                        stats_daily::Column::Provider,
                        stats_daily::Column::Model,
                    ])
                    .update_columns([
                        stats_daily::Column::RequestCount,
                        stats_daily::Column::SuccessCount,
                        stats_daily::Column::ErrorCount,
                        stats_daily::Column::ErrorBreakdown,
                        stats_daily::Column::InputTokens,
                        stats_daily::Column::OutputTokens,
                        stats_daily::Column::TotalCostUsd,
                        stats_daily::Column::Complete,
                        stats_daily::Column::UpdatedAt,
                    ])
                    .to_owned(),
                )
                .exec(self.connection())
                .await?;
        }
        Ok(())
    }

    /// Re-aggregate any recent day not yet marked complete, bounded by
    /// `max_backfill_days` (misfire recovery after downtime).
    pub async fn backfill_incomplete_days(&self, max_backfill_days: u32) -> Result<(), DbErr> {
        let today = OffsetDateTime::now_utc().date();
        for offset in 1..=max_backfill_days as i64 {
            let day = today - time::Duration::days(offset);
            let done = entities::StatsDaily::find()
                .filter(stats_daily::Column::Day.eq(day))
                .filter(stats_daily::Column::Complete.eq(true))
                .one(self.connection())
                .await?
                .is_some();
            if done {
                break;
            }
            info!(%day, "backfilling daily usage aggregation");
            self.aggregate_day(day, true).await?;
        }
        Ok(())
    }

    /// Flip usage rows stuck in `pending|streaming` past the TTL to failed.
    pub async fn reap_stuck_requests(&self, ttl_seconds: i64) -> Result<u64, DbErr> {
        use usage_records::Column;
        let cutoff = OffsetDateTime::now_utc() - time::Duration::seconds(ttl_seconds);
        let result = entities::UsageRecords::update_many()
            .col_expr(Column::Status, Expr::value("failed"))
            .col_expr(Column::ErrorCode, Expr::value("reaper_timeout"))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Status.is_in(["pending", "streaming"]))
            .filter(Column::UpdatedAt.lt(cutoff))
            .exec(self.connection())
            .await?;
        Ok(result.rows_affected)
    }
}
