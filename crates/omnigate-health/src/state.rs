//! Pure credential health state machine.
//!
//! Everything here operates on plain values so the transitions are testable
//! without a database. The manager owns loading/persisting this state onto
//! the credential row.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use omnigate_common::FailureTag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "open" => BreakerState::Open,
            "half_open" => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSample {
    pub at_ms: i64,
    pub ok: bool,
    #[serde(default)]
    pub tag: Option<FailureTag>,
    /// In-flight count observed at the instant of the outcome.
    #[serde(default)]
    pub concurrency: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtilizationSample {
    pub at_ms: i64,
    pub in_flight: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdjustmentEntry {
    pub at_ms: i64,
    pub from: i32,
    pub to: i32,
    pub reason_peak: i32,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub window_max_samples: usize,
    pub window_max_age_secs: i64,
    /// closed → open when failure rate exceeds this over min_samples.
    pub failure_rate_threshold: f64,
    pub min_samples: usize,
    pub base_probe_interval_secs: i64,
    pub max_probe_interval_minutes: i64,
    pub half_open_window_secs: i64,
    pub required_successes: i32,
    pub allowed_failures: i32,
    /// N concurrency-tagged 429 peaks within T minutes lower the learned cap.
    pub concurrency_peak_count: usize,
    pub concurrency_peak_window_secs: i64,
    /// Utilization below this fraction of the learned cap counts as low.
    pub low_utilization_threshold: f64,
    pub raise_cooldown_secs: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_max_samples: 50,
            window_max_age_secs: 300,
            failure_rate_threshold: 0.5,
            min_samples: 5,
            base_probe_interval_secs: 30,
            max_probe_interval_minutes: 30,
            half_open_window_secs: 60,
            required_successes: 3,
            allowed_failures: 1,
            concurrency_peak_count: 3,
            concurrency_peak_window_secs: 600,
            low_utilization_threshold: 0.5,
            raise_cooldown_secs: 600,
        }
    }
}

/// One credential's mutable health state.
#[derive(Debug, Clone)]
pub struct HealthState {
    pub breaker: BreakerState,
    pub opened_at: Option<OffsetDateTime>,
    pub next_probe_at: Option<OffsetDateTime>,
    pub half_open_until: Option<OffsetDateTime>,
    pub half_open_successes: i32,
    pub half_open_failures: i32,
    pub probe_interval_secs: i64,
    pub health_score: f64,
    pub consecutive_failures: i32,
    pub request_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub total_response_time_ms: i64,
    pub outcomes: Vec<OutcomeSample>,
    pub utilization: Vec<UtilizationSample>,
    pub learned_max_concurrent: i32,
    pub last_concurrent_peak: i32,
    pub adjustments: Vec<AdjustmentEntry>,
    pub last_probe_increase_at: Option<OffsetDateTime>,
}

impl HealthState {
    pub fn fresh(learned_max_concurrent: i32, probe_interval_secs: i64) -> Self {
        Self {
            breaker: BreakerState::Closed,
            opened_at: None,
            next_probe_at: None,
            half_open_until: None,
            half_open_successes: 0,
            half_open_failures: 0,
            probe_interval_secs,
            health_score: 1.0,
            consecutive_failures: 0,
            request_count: 0,
            success_count: 0,
            error_count: 0,
            total_response_time_ms: 0,
            outcomes: Vec::new(),
            utilization: Vec::new(),
            learned_max_concurrent,
            last_concurrent_peak: 0,
            adjustments: Vec::new(),
            last_probe_increase_at: None,
        }
    }
}

/// Outcome of one upstream attempt as reported by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct Outcome {
    pub ok: bool,
    pub tag: Option<FailureTag>,
    pub latency_ms: i64,
    /// In-flight count at the instant of the outcome.
    pub concurrency: i32,
}

fn prune_windows(state: &mut HealthState, now: OffsetDateTime, config: &HealthConfig) {
    let cutoff_ms =
        (now - time::Duration::seconds(config.window_max_age_secs)).unix_timestamp() * 1000;
    state.outcomes.retain(|sample| sample.at_ms >= cutoff_ms);
    if state.outcomes.len() > config.window_max_samples {
        let excess = state.outcomes.len() - config.window_max_samples;
        state.outcomes.drain(..excess);
    }
    state.utilization.retain(|sample| sample.at_ms >= cutoff_ms);
    if state.utilization.len() > config.window_max_samples {
        let excess = state.utilization.len() - config.window_max_samples;
        state.utilization.drain(..excess);
    }
}

fn window_failure_rate(state: &HealthState) -> (usize, f64) {
    let total = state.outcomes.len();
    if total == 0 {
        return (0, 0.0);
    }
    let failures = state.outcomes.iter().filter(|sample| !sample.ok).count();
    (total, failures as f64 / total as f64)
}

fn open_breaker(state: &mut HealthState, now: OffsetDateTime) {
    state.breaker = BreakerState::Open;
    state.opened_at = Some(now);
    state.next_probe_at = Some(now + time::Duration::seconds(state.probe_interval_secs));
    state.half_open_until = None;
    state.half_open_successes = 0;
    state.half_open_failures = 0;
}

fn close_breaker(state: &mut HealthState) {
    state.breaker = BreakerState::Closed;
    state.opened_at = None;
    state.next_probe_at = None;
    state.half_open_until = None;
    state.half_open_successes = 0;
    state.half_open_failures = 0;
    state.consecutive_failures = 0;
}

fn recompute_score(state: &mut HealthState) {
    let (total, failure_rate) = window_failure_rate(state);
    if total == 0 {
        return;
    }
    let success_rate = 1.0 - failure_rate;
    let avg_latency_ms = if state.request_count > 0 {
        state.total_response_time_ms as f64 / state.request_count as f64
    } else {
        0.0
    };
    let latency_factor = 1.0 / (1.0 + avg_latency_ms / 10_000.0);
    state.health_score = (success_rate * latency_factor).clamp(0.0, 1.0);
}

/// An `open` credential whose probe time has arrived moves to half-open.
/// Called by the admissibility check; half-open is entered only from open.
pub fn maybe_enter_half_open(
    state: &mut HealthState,
    now: OffsetDateTime,
    config: &HealthConfig,
) -> bool {
    if state.breaker != BreakerState::Open {
        return false;
    }
    let Some(next_probe_at) = state.next_probe_at else {
        return false;
    };
    if now < next_probe_at {
        return false;
    }
    state.breaker = BreakerState::HalfOpen;
    state.half_open_until = Some(now + time::Duration::seconds(config.half_open_window_secs));
    state.half_open_successes = 0;
    state.half_open_failures = 0;
    true
}

/// Apply one attempt outcome; returns the state mutated in place.
pub fn apply_outcome(
    state: &mut HealthState,
    outcome: Outcome,
    now: OffsetDateTime,
    config: &HealthConfig,
) {
    let at_ms = now.unix_timestamp() * 1000;
    state.request_count += 1;
    state.total_response_time_ms += outcome.latency_ms;
    if outcome.ok {
        state.success_count += 1;
        state.consecutive_failures = 0;
    } else {
        state.error_count += 1;
        state.consecutive_failures += 1;
    }
    state.outcomes.push(OutcomeSample {
        at_ms,
        ok: outcome.ok,
        tag: outcome.tag,
        concurrency: Some(outcome.concurrency),
    });
    state.utilization.push(UtilizationSample {
        at_ms,
        in_flight: outcome.concurrency,
    });
    prune_windows(state, now, config);

    match state.breaker {
        BreakerState::HalfOpen => {
            if outcome.ok {
                state.half_open_successes += 1;
                if state.half_open_successes >= config.required_successes {
                    close_breaker(state);
                    state.probe_interval_secs = config.base_probe_interval_secs;
                }
            } else {
                state.half_open_failures += 1;
                if state.half_open_failures >= config.allowed_failures {
                    // Back to open with a doubled (bounded) probe interval.
                    let doubled = (state.probe_interval_secs * 2)
                        .min(config.max_probe_interval_minutes * 60);
                    state.probe_interval_secs = doubled.max(config.base_probe_interval_secs);
                    open_breaker(state, now);
                }
            }
        }
        BreakerState::Closed => {
            let fatal = outcome.tag.is_some_and(|tag| tag.is_fatal());
            let (total, failure_rate) = window_failure_rate(state);
            if fatal
                || (total >= config.min_samples
                    && failure_rate > config.failure_rate_threshold)
            {
                state.probe_interval_secs = config.base_probe_interval_secs;
                open_breaker(state, now);
            }
        }
        BreakerState::Open => {}
    }

    adapt_concurrency(state, outcome, now, config);
    recompute_score(state);
}

/// Lower the learned cap when concurrency-tagged 429 peaks repeat; raise it
/// tentatively after sustained low utilization with no recent 429.
fn adapt_concurrency(
    state: &mut HealthState,
    outcome: Outcome,
    now: OffsetDateTime,
    config: &HealthConfig,
) {
    let now_ms = now.unix_timestamp() * 1000;
    let window_start_ms = now_ms - config.concurrency_peak_window_secs * 1000;

    if !outcome.ok && outcome.tag == Some(omnigate_common::FailureTag::Concurrent) {
        state.last_concurrent_peak = state.last_concurrent_peak.max(outcome.concurrency);
        let peaks: Vec<i32> = state
            .outcomes
            .iter()
            .filter(|sample| {
                !sample.ok
                    && sample.tag == Some(omnigate_common::FailureTag::Concurrent)
                    && sample.at_ms >= window_start_ms
            })
            .filter_map(|sample| sample.concurrency)
            .collect();
        let exceeding = peaks
            .iter()
            .filter(|peak| **peak >= state.learned_max_concurrent)
            .count();
        if exceeding >= config.concurrency_peak_count {
            let peak = peaks.iter().copied().max().unwrap_or(1);
            let lowered = ((peak as f64 * 0.9).floor() as i32).max(1);
            if lowered < state.learned_max_concurrent {
                state.adjustments.push(AdjustmentEntry {
                    at_ms: now_ms,
                    from: state.learned_max_concurrent,
                    to: lowered,
                    reason_peak: peak,
                });
                state.learned_max_concurrent = lowered;
            }
        }
        return;
    }

    // Tentative raise: sustained low utilization, cooldown elapsed, and no
    // 429 since the last raise.
    let cooldown_ok = state
        .last_probe_increase_at
        .is_none_or(|at| now - at >= time::Duration::seconds(config.raise_cooldown_secs));
    if !cooldown_ok {
        return;
    }
    let since_ms = state
        .last_probe_increase_at
        .map(|at| at.unix_timestamp() * 1000)
        .unwrap_or(window_start_ms);
    let any_429 = state.outcomes.iter().any(|sample| {
        sample.at_ms >= since_ms
            && matches!(
                sample.tag,
                Some(omnigate_common::FailureTag::RateLimit)
                    | Some(omnigate_common::FailureTag::Concurrent)
            )
    });
    if any_429 {
        return;
    }
    let recent: Vec<&UtilizationSample> = state
        .utilization
        .iter()
        .filter(|sample| sample.at_ms >= window_start_ms)
        .collect();
    if recent.len() < config.min_samples {
        return;
    }
    let threshold = state.learned_max_concurrent as f64 * config.low_utilization_threshold;
    let sustained_low = recent
        .iter()
        .all(|sample| (sample.in_flight as f64) < threshold);
    if sustained_low {
        state.learned_max_concurrent += 1;
        state.last_probe_increase_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnigate_common::FailureTag;

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
    }

    fn failure(tag: FailureTag) -> Outcome {
        Outcome {
            ok: false,
            tag: Some(tag),
            latency_ms: 100,
            concurrency: 1,
        }
    }

    fn success() -> Outcome {
        Outcome {
            ok: true,
            tag: None,
            latency_ms: 100,
            concurrency: 1,
        }
    }

    #[test]
    fn five_server_errors_open_the_breaker() {
        let config = HealthConfig::default();
        let mut state = HealthState::fresh(5, config.base_probe_interval_secs);
        for _ in 0..5 {
            apply_outcome(&mut state, failure(FailureTag::ServerError), now(), &config);
        }
        assert_eq!(state.breaker, BreakerState::Open);
        assert_eq!(
            state.next_probe_at.unwrap(),
            now() + time::Duration::seconds(config.base_probe_interval_secs)
        );
    }

    #[test]
    fn auth_failure_opens_immediately() {
        let config = HealthConfig::default();
        let mut state = HealthState::fresh(5, config.base_probe_interval_secs);
        apply_outcome(&mut state, failure(FailureTag::AuthInvalid), now(), &config);
        assert_eq!(state.breaker, BreakerState::Open);
    }

    #[test]
    fn open_to_half_open_only_after_probe_time() {
        let config = HealthConfig::default();
        let mut state = HealthState::fresh(5, config.base_probe_interval_secs);
        apply_outcome(&mut state, failure(FailureTag::AuthInvalid), now(), &config);

        assert!(!maybe_enter_half_open(&mut state, now(), &config));
        let probe_time = now() + time::Duration::seconds(config.base_probe_interval_secs);
        assert!(maybe_enter_half_open(&mut state, probe_time, &config));
        assert_eq!(state.breaker, BreakerState::HalfOpen);
        assert!(state.half_open_until.is_some());
    }

    #[test]
    fn three_probe_successes_close_the_breaker() {
        let config = HealthConfig::default();
        let mut state = HealthState::fresh(5, config.base_probe_interval_secs);
        apply_outcome(&mut state, failure(FailureTag::AuthInvalid), now(), &config);
        let probe_time = now() + time::Duration::seconds(config.base_probe_interval_secs);
        maybe_enter_half_open(&mut state, probe_time, &config);

        for _ in 0..config.required_successes {
            apply_outcome(&mut state, success(), probe_time, &config);
        }
        assert_eq!(state.breaker, BreakerState::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.next_probe_at.is_none());
    }

    #[test]
    fn probe_failure_reopens_with_doubled_interval() {
        let config = HealthConfig::default();
        let mut state = HealthState::fresh(5, config.base_probe_interval_secs);
        apply_outcome(&mut state, failure(FailureTag::AuthInvalid), now(), &config);
        let probe_time = now() + time::Duration::seconds(config.base_probe_interval_secs);
        maybe_enter_half_open(&mut state, probe_time, &config);

        apply_outcome(&mut state, failure(FailureTag::ServerError), probe_time, &config);
        assert_eq!(state.breaker, BreakerState::Open);
        assert_eq!(
            state.probe_interval_secs,
            config.base_probe_interval_secs * 2
        );
    }

    #[test]
    fn probe_interval_doubles_but_stays_bounded() {
        let config = HealthConfig {
            max_probe_interval_minutes: 1,
            ..Default::default()
        };
        let mut state = HealthState::fresh(5, config.base_probe_interval_secs);
        let mut t = now();
        for _ in 0..6 {
            apply_outcome(&mut state, failure(FailureTag::AuthInvalid), t, &config);
            t += time::Duration::seconds(state.probe_interval_secs);
            maybe_enter_half_open(&mut state, t, &config);
            apply_outcome(&mut state, failure(FailureTag::ServerError), t, &config);
        }
        assert!(state.probe_interval_secs <= 60);
    }

    #[test]
    fn concurrency_peaks_lower_learned_cap() {
        let config = HealthConfig::default();
        let mut state = HealthState::fresh(10, config.base_probe_interval_secs);
        for _ in 0..config.concurrency_peak_count {
            apply_outcome(
                &mut state,
                Outcome {
                    ok: false,
                    tag: Some(FailureTag::Concurrent),
                    latency_ms: 50,
                    concurrency: 10,
                },
                now(),
                &config,
            );
        }
        assert_eq!(state.learned_max_concurrent, 9); // floor(0.9 * 10)
        assert_eq!(state.adjustments.len(), 1);
        assert_eq!(state.last_concurrent_peak, 10);
    }

    #[test]
    fn learned_cap_never_drops_below_one() {
        let config = HealthConfig::default();
        let mut state = HealthState::fresh(1, config.base_probe_interval_secs);
        for _ in 0..config.concurrency_peak_count {
            apply_outcome(
                &mut state,
                Outcome {
                    ok: false,
                    tag: Some(FailureTag::Concurrent),
                    latency_ms: 50,
                    concurrency: 1,
                },
                now(),
                &config,
            );
        }
        assert!(state.learned_max_concurrent >= 1);
    }

    #[test]
    fn sustained_low_utilization_raises_cap() {
        let config = HealthConfig::default();
        let mut state = HealthState::fresh(10, config.base_probe_interval_secs);
        for _ in 0..config.min_samples {
            apply_outcome(
                &mut state,
                Outcome {
                    ok: true,
                    tag: None,
                    latency_ms: 50,
                    concurrency: 1,
                },
                now(),
                &config,
            );
        }
        assert_eq!(state.learned_max_concurrent, 11);
        assert!(state.last_probe_increase_at.is_some());
    }

    #[test]
    fn window_is_capped_by_count() {
        let config = HealthConfig {
            window_max_samples: 10,
            ..Default::default()
        };
        let mut state = HealthState::fresh(5, config.base_probe_interval_secs);
        for _ in 0..50 {
            apply_outcome(&mut state, success(), now(), &config);
        }
        assert!(state.outcomes.len() <= 10);
    }

    #[test]
    fn health_score_degrades_with_failures() {
        let config = HealthConfig::default();
        let mut state = HealthState::fresh(5, config.base_probe_interval_secs);
        apply_outcome(&mut state, success(), now(), &config);
        let healthy = state.health_score;
        apply_outcome(&mut state, failure(FailureTag::ServerError), now(), &config);
        apply_outcome(&mut state, failure(FailureTag::ServerError), now(), &config);
        assert!(state.health_score < healthy);
    }
}
