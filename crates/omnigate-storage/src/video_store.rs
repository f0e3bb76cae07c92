//! Video task persistence for the async poller's three-phase loop.

use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveValue, EntityTrait, ExprTrait, QueryFilter, QueryOrder, QuerySelect};
use time::OffsetDateTime;

use crate::GatewayStorage;
use crate::entities::{self, video_tasks};

#[derive(Debug, Clone)]
pub struct NewVideoTask {
    pub request_id: String,
    pub external_task_id: String,
    pub provider_id: i64,
    pub endpoint_id: i64,
    pub credential_id: i64,
    pub model: String,
    pub poll_interval_seconds: i64,
    pub max_poll_count: i32,
    pub rule_snapshot: Option<Json>,
}

impl GatewayStorage {
    pub async fn insert_video_task(&self, task: NewVideoTask) -> Result<(), DbErr> {
        let now = OffsetDateTime::now_utc();
        let active = video_tasks::ActiveModel {
            id: ActiveValue::NotSet,
            request_id: ActiveValue::Set(task.request_id),
            external_task_id: ActiveValue::Set(task.external_task_id),
            provider_id: ActiveValue::Set(task.provider_id),
            endpoint_id: ActiveValue::Set(task.endpoint_id),
            credential_id: ActiveValue::Set(task.credential_id),
            model: ActiveValue::Set(task.model),
            status: ActiveValue::Set("submitted".to_string()),
            poll_count: ActiveValue::Set(0),
            max_poll_count: ActiveValue::Set(task.max_poll_count),
            poll_interval_seconds: ActiveValue::Set(task.poll_interval_seconds),
            retry_count: ActiveValue::Set(0),
            next_poll_at: ActiveValue::Set(
                now + time::Duration::seconds(task.poll_interval_seconds),
            ),
            progress: ActiveValue::Set(None),
            result_urls: ActiveValue::Set(None),
            result_expires_at: ActiveValue::Set(None),
            error_code: ActiveValue::Set(None),
            error_message: ActiveValue::Set(None),
            raw_response: ActiveValue::Set(None),
            rule_snapshot: ActiveValue::Set(task.rule_snapshot),
            submitted_at: ActiveValue::Set(now),
            completed_at: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
            ..Default::default()
        };
        entities::VideoTasks::insert(active)
            .exec(self.connection())
            .await?;
        Ok(())
    }

    /// Jobs due for a poll, ordered by `next_poll_at`.
    pub async fn list_due_video_tasks(
        &self,
        now: OffsetDateTime,
        limit: u64,
    ) -> Result<Vec<i64>, DbErr> {
        use video_tasks::Column;
        let rows = entities::VideoTasks::find()
            .filter(Column::Status.is_in(["submitted", "processing"]))
            .filter(Column::NextPollAt.lte(now))
            .filter(Expr::col(Column::PollCount).lt(Expr::col(Column::MaxPollCount)))
            .order_by_asc(Column::NextPollAt)
            .limit(limit)
            .all(self.connection())
            .await?;
        Ok(rows.into_iter().map(|row| row.id).collect())
    }

    pub async fn get_video_task(&self, id: i64) -> Result<Option<video_tasks::Model>, DbErr> {
        entities::VideoTasks::find_by_id(id)
            .one(self.connection())
            .await
    }

    /// Still running: bump poll_count, reschedule.
    pub async fn reschedule_video_task(
        &self,
        id: i64,
        progress: Option<f64>,
        retry_count: i32,
        next_poll_at: OffsetDateTime,
    ) -> Result<(), DbErr> {
        use video_tasks::Column;
        entities::VideoTasks::update_many()
            .col_expr(Column::Status, Expr::value("processing"))
            .col_expr(Column::PollCount, Expr::col(Column::PollCount).add(1))
            .col_expr(Column::RetryCount, Expr::value(retry_count))
            .col_expr(Column::Progress, Expr::value(progress))
            .col_expr(Column::NextPollAt, Expr::value(next_poll_at))
            .col_expr(Column::UpdatedAt, Expr::value(OffsetDateTime::now_utc()))
            .filter(Column::Id.eq(id))
            .exec(self.connection())
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn finish_video_task(
        &self,
        id: i64,
        status: &str,
        result_urls: Option<Json>,
        result_expires_at: Option<OffsetDateTime>,
        error_code: Option<String>,
        error_message: Option<String>,
        raw_response: Option<Json>,
    ) -> Result<(), DbErr> {
        use video_tasks::Column;
        let now = OffsetDateTime::now_utc();
        entities::VideoTasks::update_many()
            .col_expr(Column::Status, Expr::value(status))
            .col_expr(Column::ResultUrls, Expr::value(result_urls))
            .col_expr(Column::ResultExpiresAt, Expr::value(result_expires_at))
            .col_expr(Column::ErrorCode, Expr::value(error_code))
            .col_expr(Column::ErrorMessage, Expr::value(error_message))
            .col_expr(Column::RawResponse, Expr::value(raw_response))
            .col_expr(Column::CompletedAt, Expr::value(now))
            .col_expr(Column::UpdatedAt, Expr::value(now))
            .filter(Column::Id.eq(id))
            .filter(Column::Status.is_in(["submitted", "processing"]))
            .exec(self.connection())
            .await?;
        Ok(())
    }

    pub async fn find_video_task_by_request_id(
        &self,
        request_id: &str,
    ) -> Result<Option<video_tasks::Model>, DbErr> {
        entities::VideoTasks::find()
            .filter(video_tasks::Column::RequestId.eq(request_id))
            .one(self.connection())
            .await
    }
}
