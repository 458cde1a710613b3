//! Fixed-window rate limiter for mediated network calls.
//!
//! One window per key, normally a `RateKey` (tenant plus extension). A window's count only grows
//! until the window has fully elapsed; then the next call opens a fresh one.
//! Stale windows are swept at most once per window length, on access.

use extbox_types::RateKey;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started: Instant,
    count: u64,
}

struct LimiterState<K> {
    windows: HashMap<K, RateWindow>,
    last_sweep: Instant,
}

pub struct RateLimiter<K = RateKey> {
    max_requests: u64,
    window: Duration,
    state: Mutex<LimiterState<K>>,
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(max_requests: u64, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new(LimiterState {
                windows: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub fn check(&self, key: K) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    /// Counts one call for `key` at time `now`.
    pub fn check_at(&self, key: K, now: Instant) -> RateDecision {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        if now.saturating_duration_since(state.last_sweep) >= self.window {
            let window = self.window;
            let before = state.windows.len();
            state
                .windows
                .retain(|_, w| now.saturating_duration_since(w.started) < window);
            state.last_sweep = now;
            debug!(swept = before - state.windows.len(), "Swept stale rate windows");
        }

        let entry = state
            .windows
            .entry(key)
            .or_insert(RateWindow {
                started: now,
                count: 0,
            });

        if now.saturating_duration_since(entry.started) >= self.window {
            *entry = RateWindow {
                started: now,
                count: 0,
            };
        }

        if entry.count < self.max_requests {
            entry.count += 1;
            RateDecision::Allowed
        } else {
            let elapsed = now.saturating_duration_since(entry.started);
            RateDecision::Denied {
                retry_after: self.window.saturating_sub(elapsed),
            }
        }
    }

    /// Number of live windows, for diagnostics.
    pub fn tracked_keys(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .windows
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::<&str>::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check_at("g:a", now).is_allowed());
        assert!(!limiter.check_at("g:a", now).is_allowed());
        assert!(limiter.check_at("g:b", now).is_allowed());
    }

    #[test]
    fn stale_windows_are_swept_lazily() {
        let limiter = RateLimiter::<&str>::new(5, Duration::from_millis(100));
        let t0 = Instant::now();
        limiter.check_at("g:a", t0);
        limiter.check_at("g:b", t0);
        assert_eq!(limiter.tracked_keys(), 2);

        limiter.check_at("g:c", t0 + Duration::from_millis(250));
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
