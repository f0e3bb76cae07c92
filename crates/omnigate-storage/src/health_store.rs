//! Credential health persistence. Row-scoped optimistic updates: a lost
//! update degrades to approximate counting, never corruption.

use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, EntityTrait, QueryFilter};
use time::OffsetDateTime;

use crate::GatewayStorage;
use crate::entities::{self, provider_api_keys};

/// Snapshot of the mutable health fields written back by the manager.
#[derive(Debug, Clone)]
pub struct HealthUpdate {
    pub health_score: f64,
    pub consecutive_failures: i32,
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub total_response_time_ms: i64,
    pub utilization_samples: Option<Json>,
    pub request_results_window: Option<Json>,
    pub circuit_state: String,
    pub circuit_opened_at: Option<OffsetDateTime>,
    pub next_probe_at: Option<OffsetDateTime>,
    pub half_open_until: Option<OffsetDateTime>,
    pub half_open_successes: i32,
    pub half_open_failures: i32,
    pub probe_interval_seconds: i64,
    pub learned_max_concurrent: i32,
    pub last_concurrent_peak: i32,
    pub adjustment_history: Option<Json>,
    pub last_probe_increase_at: Option<OffsetDateTime>,
}

impl GatewayStorage {
    pub async fn load_credential(
        &self,
        credential_id: i64,
    ) -> Result<Option<provider_api_keys::Model>, DbErr> {
        entities::ProviderApiKeys::find_by_id(credential_id)
            .one(self.connection())
            .await
    }

    /// Write health state back, guarded by the row's `updated_at`. Returns
    /// false when another writer got there first.
    pub async fn persist_health(
        &self,
        credential_id: i64,
        seen_updated_at: OffsetDateTime,
        update: HealthUpdate,
    ) -> Result<bool, DbErr> {
        use provider_api_keys::Column;
        let active = provider_api_keys::ActiveModel {
            health_score: ActiveValue::Set(update.health_score),
            consecutive_failures: ActiveValue::Set(update.consecutive_failures),
            request_count: ActiveValue::Set(update.request_count),
            success_count: ActiveValue::Set(update.success_count),
            error_count: ActiveValue::Set(update.error_count),
            total_response_time_ms: ActiveValue::Set(update.total_response_time_ms),
            utilization_samples: ActiveValue::Set(update.utilization_samples),
            request_results_window: ActiveValue::Set(update.request_results_window),
            circuit_state: ActiveValue::Set(update.circuit_state),
            circuit_opened_at: ActiveValue::Set(update.circuit_opened_at),
            next_probe_at: ActiveValue::Set(update.next_probe_at),
            half_open_until: ActiveValue::Set(update.half_open_until),
            half_open_successes: ActiveValue::Set(update.half_open_successes),
            half_open_failures: ActiveValue::Set(update.half_open_failures),
            probe_interval_seconds: ActiveValue::Set(update.probe_interval_seconds),
            learned_max_concurrent: ActiveValue::Set(update.learned_max_concurrent),
            last_concurrent_peak: ActiveValue::Set(update.last_concurrent_peak),
            adjustment_history: ActiveValue::Set(update.adjustment_history),
            last_probe_increase_at: ActiveValue::Set(update.last_probe_increase_at),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        let result = entities::ProviderApiKeys::update_many()
            .set(active)
            .filter(Column::Id.eq(credential_id))
            .filter(Column::UpdatedAt.eq(seen_updated_at))
            .exec(self.connection())
            .await?;
        Ok(result.rows_affected > 0)
    }
}
