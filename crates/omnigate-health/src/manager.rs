//! Credential health manager: process-local in-flight counters and probe
//! slots, plus load/persist of the durable state machine.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tracing::debug;

use omnigate_storage::entities::provider_api_keys;
use omnigate_storage::{GatewayStorage, health_store::HealthUpdate};

use crate::state::{
    self, BreakerState, HealthConfig, HealthState, Outcome, OutcomeSample, UtilizationSample,
};

/// Why the planner skipped a credential; recorded in the candidate ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    CircuitOpen,
    ProbeBusy,
    ConcurrencyLimit,
    RateLimit,
    DailyQuota,
    MonthlyQuota,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::CircuitOpen => "circuit_open",
            SkipReason::ProbeBusy => "probe_busy",
            SkipReason::ConcurrencyLimit => "concurrent_limit",
            SkipReason::RateLimit => "rate_limited",
            SkipReason::DailyQuota => "daily_quota",
            SkipReason::MonthlyQuota => "monthly_quota",
        }
    }
}

/// The subset of credential config the admissibility test reads.
#[derive(Debug, Clone)]
pub struct CredentialLimits {
    pub credential_id: i64,
    pub max_concurrent: i32,
    pub rate_limit_per_minute: Option<i32>,
    pub rate_multiplier: f64,
    pub daily_quota_usd: Option<f64>,
    pub daily_used_usd: f64,
    pub monthly_quota_usd: Option<f64>,
    pub monthly_used_usd: f64,
}

impl From<&provider_api_keys::Model> for CredentialLimits {
    fn from(row: &provider_api_keys::Model) -> Self {
        Self {
            credential_id: row.id,
            max_concurrent: row.max_concurrent,
            rate_limit_per_minute: row.rate_limit_per_minute,
            rate_multiplier: row.rate_multiplier,
            daily_quota_usd: row.daily_quota_usd,
            daily_used_usd: row.daily_used_usd,
            monthly_quota_usd: row.monthly_quota_usd,
            monthly_used_usd: row.monthly_used_usd,
        }
    }
}

struct Slot {
    in_flight: Arc<AtomicI32>,
    probe_taken: Arc<AtomicBool>,
    recent_requests: Mutex<VecDeque<OffsetDateTime>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicI32::new(0)),
            probe_taken: Arc::new(AtomicBool::new(false)),
            recent_requests: Mutex::new(VecDeque::new()),
        }
    }
}

/// RAII guard over one in-flight slot (and the probe slot during half-open).
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<AtomicI32>,
    probe_taken: Option<Arc<AtomicBool>>,
    /// In-flight count at acquisition, for ledger/peak accounting.
    pub observed_concurrency: i32,
    pub is_probe: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Some(probe) = &self.probe_taken {
            probe.store(false, Ordering::SeqCst);
        }
    }
}

pub struct HealthManager {
    storage: GatewayStorage,
    config: HealthConfig,
    slots: Mutex<HashMap<i64, Arc<Slot>>>,
}

impl HealthManager {
    pub fn new(storage: GatewayStorage, config: HealthConfig) -> Self {
        Self {
            storage,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    fn slot(&self, credential_id: i64) -> Arc<Slot> {
        let mut guard = self.slots.lock().expect("slot map lock poisoned");
        guard
            .entry(credential_id)
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    pub fn in_flight(&self, credential_id: i64) -> i32 {
        self.slot(credential_id).in_flight.load(Ordering::SeqCst)
    }

    /// The admissibility test (§ candidate planning). Mutates `state` when
    /// an open breaker transitions to half-open at probe time.
    pub fn try_acquire(
        &self,
        limits: &CredentialLimits,
        state: &mut HealthState,
        now: OffsetDateTime,
    ) -> Result<InFlightGuard, SkipReason> {
        let slot = self.slot(limits.credential_id);

        state::maybe_enter_half_open(state, now, &self.config);

        let mut probe_claim: Option<Arc<AtomicBool>> = None;
        match state.breaker {
            BreakerState::Closed => {}
            BreakerState::Open => return Err(SkipReason::CircuitOpen),
            BreakerState::HalfOpen => {
                // Exactly one probe at a time; contenders see not-admissible.
                if slot
                    .probe_taken
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(SkipReason::ProbeBusy);
                }
                probe_claim = Some(slot.probe_taken.clone());
            }
        }

        let release_probe = |claim: &Option<Arc<AtomicBool>>| {
            if let Some(probe) = claim {
                probe.store(false, Ordering::SeqCst);
            }
        };

        let cap = limits.max_concurrent.min(state.learned_max_concurrent).max(1);
        let observed = slot.in_flight.fetch_add(1, Ordering::SeqCst);
        if observed >= cap {
            slot.in_flight.fetch_sub(1, Ordering::SeqCst);
            release_probe(&probe_claim);
            return Err(SkipReason::ConcurrencyLimit);
        }

        if let Some(rate_limit) = limits.rate_limit_per_minute {
            let effective = (rate_limit as f64 * limits.rate_multiplier).max(1.0) as usize;
            let mut recent = slot.recent_requests.lock().expect("rate window poisoned");
            let cutoff = now - time::Duration::minutes(1);
            while recent.front().is_some_and(|at| *at < cutoff) {
                recent.pop_front();
            }
            if recent.len() >= effective {
                drop(recent);
                slot.in_flight.fetch_sub(1, Ordering::SeqCst);
                release_probe(&probe_claim);
                return Err(SkipReason::RateLimit);
            }
            recent.push_back(now);
        }

        if let Some(quota) = limits.daily_quota_usd
            && limits.daily_used_usd >= quota
        {
            slot.in_flight.fetch_sub(1, Ordering::SeqCst);
            release_probe(&probe_claim);
            return Err(SkipReason::DailyQuota);
        }
        if let Some(quota) = limits.monthly_quota_usd
            && limits.monthly_used_usd >= quota
        {
            slot.in_flight.fetch_sub(1, Ordering::SeqCst);
            release_probe(&probe_claim);
            return Err(SkipReason::MonthlyQuota);
        }

        Ok(InFlightGuard {
            in_flight: slot.in_flight.clone(),
            is_probe: probe_claim.is_some(),
            probe_taken: probe_claim,
            observed_concurrency: observed + 1,
        })
    }

    /// Decode the durable health fields of one credential row.
    pub fn state_from_row(&self, row: &provider_api_keys::Model) -> HealthState {
        let outcomes: Vec<OutcomeSample> = row
            .request_results_window
            .as_ref()
            .and_then(|json| serde_json::from_value(json.clone()).ok())
            .unwrap_or_default();
        let utilization: Vec<UtilizationSample> = row
            .utilization_samples
            .as_ref()
            .and_then(|json| serde_json::from_value(json.clone()).ok())
            .unwrap_or_default();
        let adjustments = row
            .adjustment_history
            .as_ref()
            .and_then(|json| serde_json::from_value(json.clone()).ok())
            .unwrap_or_default();
        HealthState {
            breaker: BreakerState::parse(&row.circuit_state),
            opened_at: row.circuit_opened_at,
            next_probe_at: row.next_probe_at,
            half_open_until: row.half_open_until,
            half_open_successes: row.half_open_successes,
            half_open_failures: row.half_open_failures,
            probe_interval_secs: row.probe_interval_seconds,
            health_score: row.health_score,
            consecutive_failures: row.consecutive_failures,
            request_count: row.request_count,
            success_count: row.success_count,
            error_count: row.error_count,
            total_response_time_ms: row.total_response_time_ms,
            outcomes,
            utilization,
            learned_max_concurrent: row.learned_max_concurrent.max(1),
            last_concurrent_peak: row.last_concurrent_peak,
            adjustments,
            last_probe_increase_at: row.last_probe_increase_at,
        }
    }

    fn update_from_state(&self, state: &HealthState) -> HealthUpdate {
        HealthUpdate {
            health_score: state.health_score,
            consecutive_failures: state.consecutive_failures,
            request_count: state.request_count,
            success_count: state.success_count,
            error_count: state.error_count,
            total_response_time_ms: state.total_response_time_ms,
            utilization_samples: serde_json::to_value(&state.utilization).ok(),
            request_results_window: serde_json::to_value(&state.outcomes).ok(),
            circuit_state: state.breaker.as_str().to_string(),
            circuit_opened_at: state.opened_at,
            next_probe_at: state.next_probe_at,
            half_open_until: state.half_open_until,
            half_open_successes: state.half_open_successes,
            half_open_failures: state.half_open_failures,
            probe_interval_seconds: state.probe_interval_secs,
            learned_max_concurrent: state.learned_max_concurrent,
            last_concurrent_peak: state.last_concurrent_peak,
            adjustment_history: serde_json::to_value(&state.adjustments).ok(),
            last_probe_increase_at: state.last_probe_increase_at,
        }
    }

    /// Record one attempt outcome against the durable row. A lost optimistic
    /// update degrades to approximate counting.
    pub async fn record_outcome(
        &self,
        credential_id: i64,
        outcome: Outcome,
    ) -> Result<(), sea_orm::DbErr> {
        let Some(row) = self.storage.load_credential(credential_id).await? else {
            return Ok(());
        };
        let mut state = self.state_from_row(&row);
        state::apply_outcome(&mut state, outcome, OffsetDateTime::now_utc(), &self.config);
        let update = self.update_from_state(&state);
        let applied = self
            .storage
            .persist_health(credential_id, row.updated_at, update)
            .await?;
        if !applied {
            debug!(credential_id, "health update lost to a concurrent writer");
        }
        Ok(())
    }

    /// Persist a half-open transition made during admissibility, so other
    /// workers observe it.
    pub async fn persist_state(
        &self,
        credential_id: i64,
        seen_updated_at: OffsetDateTime,
        state: &HealthState,
    ) -> Result<bool, sea_orm::DbErr> {
        self.storage
            .persist_health(credential_id, seen_updated_at, self.update_from_state(state))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_concurrent: i32) -> CredentialLimits {
        CredentialLimits {
            credential_id: 1,
            max_concurrent,
            rate_limit_per_minute: None,
            rate_multiplier: 1.0,
            daily_quota_usd: None,
            daily_used_usd: 0.0,
            monthly_quota_usd: None,
            monthly_used_usd: 0.0,
        }
    }

    fn manager() -> HealthManager {
        // Storage is only touched by the async paths; the admissibility test
        // is process-local.
        let connection = sea_orm::DatabaseConnection::default();
        HealthManager::new(GatewayStorage::new(connection), HealthConfig::default())
    }

    #[test]
    fn max_concurrent_one_admits_exactly_one() {
        let manager = manager();
        let mut state = HealthState::fresh(1, 30);
        let now = OffsetDateTime::now_utc();

        let first = manager.try_acquire(&limits(1), &mut state, now).unwrap();
        let second = manager.try_acquire(&limits(1), &mut state, now);
        assert_eq!(second.unwrap_err(), SkipReason::ConcurrencyLimit);

        drop(first);
        assert!(manager.try_acquire(&limits(1), &mut state, now).is_ok());
    }

    #[test]
    fn open_breaker_is_not_admissible() {
        let manager = manager();
        let config = HealthConfig::default();
        let mut state = HealthState::fresh(5, config.base_probe_interval_secs);
        let now = OffsetDateTime::now_utc();
        state::apply_outcome(
            &mut state,
            Outcome {
                ok: false,
                tag: Some(omnigate_common::FailureTag::AuthInvalid),
                latency_ms: 10,
                concurrency: 1,
            },
            now,
            &config,
        );
        assert_eq!(
            manager.try_acquire(&limits(5), &mut state, now).unwrap_err(),
            SkipReason::CircuitOpen
        );
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let manager = manager();
        let config = HealthConfig::default();
        let mut state = HealthState::fresh(5, config.base_probe_interval_secs);
        let now = OffsetDateTime::now_utc();
        state::apply_outcome(
            &mut state,
            Outcome {
                ok: false,
                tag: Some(omnigate_common::FailureTag::AuthInvalid),
                latency_ms: 10,
                concurrency: 1,
            },
            now,
            &config,
        );
        let probe_time = now + time::Duration::seconds(config.base_probe_interval_secs);

        let probe = manager
            .try_acquire(&limits(5), &mut state, probe_time)
            .unwrap();
        assert!(probe.is_probe);
        assert_eq!(state.breaker, BreakerState::HalfOpen);

        // A second planner call sees the probe slot taken.
        let contender = manager.try_acquire(&limits(5), &mut state, probe_time);
        assert_eq!(contender.unwrap_err(), SkipReason::ProbeBusy);

        // Probe completion frees the slot.
        drop(probe);
        assert!(manager.try_acquire(&limits(5), &mut state, probe_time).is_ok());
    }

    #[test]
    fn rate_window_blocks_past_the_limit() {
        let manager = manager();
        let mut state = HealthState::fresh(10, 30);
        let now = OffsetDateTime::now_utc();
        let limits = CredentialLimits {
            rate_limit_per_minute: Some(2),
            ..limits(10)
        };
        let _a = manager.try_acquire(&limits, &mut state, now).unwrap();
        let _b = manager.try_acquire(&limits, &mut state, now).unwrap();
        assert_eq!(
            manager.try_acquire(&limits, &mut state, now).unwrap_err(),
            SkipReason::RateLimit
        );
    }

    #[test]
    fn exhausted_daily_quota_is_skipped() {
        let manager = manager();
        let mut state = HealthState::fresh(10, 30);
        let now = OffsetDateTime::now_utc();
        let limits = CredentialLimits {
            daily_quota_usd: Some(5.0),
            daily_used_usd: 5.0,
            ..limits(10)
        };
        assert_eq!(
            manager.try_acquire(&limits, &mut state, now).unwrap_err(),
            SkipReason::DailyQuota
        );
    }
}
