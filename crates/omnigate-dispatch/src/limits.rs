//! Per-API-key request gates: in-flight concurrency and a one-minute rate
//! window, both process-local.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

use omnigate_common::ErrorCategory;
use omnigate_storage::entities::api_keys;

use crate::error::DispatchError;

struct KeyState {
    in_flight: Arc<AtomicI32>,
    recent: Mutex<VecDeque<OffsetDateTime>>,
}

#[derive(Default)]
pub struct KeyLimiter {
    keys: Mutex<HashMap<i64, Arc<KeyState>>>,
}

/// RAII guard over one in-flight slot for an API key.
#[derive(Debug)]
pub struct KeyGuard {
    in_flight: Arc<AtomicI32>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl KeyLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self, key_id: i64) -> Arc<KeyState> {
        let mut keys = self.keys.lock().expect("key limiter poisoned");
        keys.entry(key_id)
            .or_insert_with(|| {
                Arc::new(KeyState {
                    in_flight: Arc::new(AtomicI32::new(0)),
                    recent: Mutex::new(VecDeque::new()),
                })
            })
            .clone()
    }

    pub fn admit(
        &self,
        key: &api_keys::Model,
        now: OffsetDateTime,
    ) -> Result<KeyGuard, DispatchError> {
        let state = self.state(key.id);

        if let Some(max_concurrent) = key.max_concurrent {
            let observed = state.in_flight.fetch_add(1, Ordering::SeqCst);
            if observed >= max_concurrent {
                state.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(DispatchError::new(
                    ErrorCategory::QuotaExceeded,
                    "too many concurrent requests for this key",
                ));
            }
        } else {
            state.in_flight.fetch_add(1, Ordering::SeqCst);
        }

        if let Some(rate_limit) = key.rate_limit_per_minute {
            let mut recent = state.recent.lock().expect("key rate window poisoned");
            let cutoff = now - time::Duration::minutes(1);
            while recent.front().is_some_and(|at| *at < cutoff) {
                recent.pop_front();
            }
            if recent.len() >= rate_limit.max(1) as usize {
                drop(recent);
                state.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(DispatchError::new(
                    ErrorCategory::QuotaExceeded,
                    "per-minute rate limit exceeded for this key",
                ));
            }
            recent.push_back(now);
        }

        Ok(KeyGuard {
            in_flight: state.in_flight.clone(),
        })
    }
}
