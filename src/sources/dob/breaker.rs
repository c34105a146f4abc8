//! Circuit breaker guarding the DOB scraper.
//!
//! Closed → Open when failures in the rolling window reach the threshold (or
//! the failure rate reaches 50% over a minimum sample). Open → Half-Open once
//! the cool-down elapses. Half-Open admits exactly one trial: success closes
//! the breaker, failure re-opens it with a doubled cool-down (capped).
//!
//! All transitions happen under one mutex; the lock is never held across an
//! await point.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::SourceError;

// ---

const MIN_RATE_SAMPLE: usize = 10;
const FAILURE_RATE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    // ---
    pub failure_threshold: u32,
    pub window: Duration,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    // ---
    Closed,
    Open { until: Instant },
    /// The single trial call is in flight; everyone else is refused.
    HalfOpen,
}

/// Serializable view of the breaker for health output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    // ---
    pub state: &'static str,
    pub recent_failures: usize,
    pub recent_attempts: usize,
    pub cooldown_remaining_secs: u64,
    pub current_cooldown_secs: u64,
}

#[derive(Debug)]
struct Inner {
    // ---
    state: BreakerState,
    /// `(when, succeeded)` for attempts inside the rolling window.
    outcomes: VecDeque<(Instant, bool)>,
    cooldown: Duration,
}

impl Inner {
    // ---
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&(at, _)) = self.outcomes.front() {
            if now.saturating_duration_since(at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures(&self) -> usize {
        self.outcomes.iter().filter(|(_, ok)| !ok).count()
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    // ---
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    // ---
    pub fn new(name: &'static str, config: BreakerConfig) -> Arc<Self> {
        // ---
        let cooldown = config.cooldown;
        Arc::new(Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                outcomes: VecDeque::new(),
                cooldown,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Ask to make a call. Fails fast with [`SourceError::CircuitOpen`]
    /// without touching the upstream.
    pub fn try_acquire(self: &Arc<Self>) -> Result<BreakerPermit, SourceError> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(self: &Arc<Self>, now: Instant) -> Result<BreakerPermit, SourceError> {
        // ---
        let mut inner = self.lock();
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open { until } if now >= until => {
                info!(breaker = self.name, "Cool-down elapsed, breaker half-open");
                inner.state = BreakerState::HalfOpen;
                true
            }
            BreakerState::Open { .. } | BreakerState::HalfOpen => return Err(SourceError::CircuitOpen),
        };

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    fn on_success(&self, trial: bool, now: Instant) {
        // ---
        let mut inner = self.lock();
        if trial {
            info!(breaker = self.name, "Trial call succeeded, breaker closed");
            inner.state = BreakerState::Closed;
            inner.outcomes.clear();
            inner.cooldown = self.config.cooldown;
            return;
        }
        inner.outcomes.push_back((now, true));
        inner.prune(now, self.config.window);
    }

    fn on_failure(&self, trial: bool, now: Instant) {
        // ---
        let mut inner = self.lock();
        if trial {
            let cooldown = (inner.cooldown * 2).min(self.config.max_cooldown);
            inner.cooldown = cooldown;
            inner.state = BreakerState::Open {
                until: now + cooldown,
            };
            warn!(
                breaker = self.name,
                "Trial call failed, breaker re-opened for {:?}", cooldown
            );
            return;
        }

        if inner.state != BreakerState::Closed {
            // A call admitted before the breaker opened; it does not extend the cool-down.
            return;
        }

        inner.outcomes.push_back((now, false));
        inner.prune(now, self.config.window);

        let failures = inner.failures();
        let attempts = inner.outcomes.len();
        let rate_tripped = attempts >= MIN_RATE_SAMPLE
            && failures as f64 / attempts as f64 >= FAILURE_RATE_THRESHOLD;
        if failures >= self.config.failure_threshold as usize || rate_tripped {
            let cooldown = inner.cooldown;
            inner.state = BreakerState::Open {
                until: now + cooldown,
            };
            warn!(
                breaker = self.name,
                failures, attempts, "Breaker OPEN, skipping calls for {:?}", cooldown
            );
        }
    }

    pub fn status(&self) -> BreakerStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> BreakerStatus {
        // ---
        let mut inner = self.lock();
        inner.prune(now, self.config.window);
        let (state, remaining) = match inner.state {
            BreakerState::Closed => ("closed", Duration::ZERO),
            BreakerState::Open { until } => ("open", until.saturating_duration_since(now)),
            BreakerState::HalfOpen => ("half_open", Duration::ZERO),
        };
        BreakerStatus {
            state,
            recent_failures: inner.failures(),
            recent_attempts: inner.outcomes.len(),
            cooldown_remaining_secs: remaining.as_secs(),
            current_cooldown_secs: inner.cooldown.as_secs(),
        }
    }
}

/// Permission to make one call. Must be settled with
/// [`succeed`](Self::succeed) or [`fail`](Self::fail); a permit dropped
/// unsettled (the call was cancelled) counts as a failure so a half-open
/// trial slot is never leaked.
#[derive(Debug)]
pub struct BreakerPermit {
    // ---
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl BreakerPermit {
    // ---
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn succeed(self) {
        self.succeed_at(Instant::now())
    }

    pub fn succeed_at(mut self, now: Instant) {
        self.settled = true;
        self.breaker.on_success(self.trial, now);
    }

    pub fn fail(self) {
        self.fail_at(Instant::now())
    }

    pub fn fail_at(mut self, now: Instant) {
        self.settled = true;
        self.breaker.on_failure(self.trial, now);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.on_failure(self.trial, Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn breaker() -> Arc<CircuitBreaker> {
        CircuitBreaker::new("test", BreakerConfig::default())
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        // ---
        let b = breaker();
        let t0 = Instant::now();
        for i in 0..5 {
            let permit = b.try_acquire_at(t0 + secs(i)).unwrap();
            permit.fail_at(t0 + secs(i));
        }
        assert!(matches!(b.state(), BreakerState::Open { .. }));
        assert_eq!(b.try_acquire_at(t0 + secs(6)).unwrap_err(), SourceError::CircuitOpen);
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        // ---
        let b = breaker();
        let t0 = Instant::now();
        for i in 0..4 {
            b.try_acquire_at(t0).unwrap().fail_at(t0 + secs(i));
        }
        // 61s later the first four have aged out.
        let later = t0 + secs(70);
        b.try_acquire_at(later).unwrap().fail_at(later);
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.status_at(later).recent_failures, 1);
    }

    #[test]
    fn test_failure_rate_trips_breaker() {
        // ---
        let config = BreakerConfig {
            failure_threshold: 100,
            ..BreakerConfig::default()
        };
        let b = CircuitBreaker::new("rate", config);
        let t0 = Instant::now();
        for i in 0..10u64 {
            let permit = b.try_acquire_at(t0 + secs(i)).unwrap();
            if i % 2 == 0 {
                permit.succeed_at(t0 + secs(i));
            } else {
                permit.fail_at(t0 + secs(i));
            }
        }
        assert!(matches!(b.state(), BreakerState::Open { .. }));
    }

    #[test]
    fn test_half_open_admits_exactly_one_trial() {
        // ---
        let b = breaker();
        let t0 = Instant::now();
        for _ in 0..5 {
            b.try_acquire_at(t0).unwrap().fail_at(t0);
        }
        assert!(b.try_acquire_at(t0 + secs(29)).is_err());

        let trial = b.try_acquire_at(t0 + secs(30)).unwrap();
        assert!(trial.is_trial());
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert_eq!(b.status_at(t0 + secs(31)).state, "half_open");
        assert_eq!(b.try_acquire_at(t0 + secs(31)).unwrap_err(), SourceError::CircuitOpen);

        trial.succeed_at(t0 + secs(32));
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.status_at(t0 + secs(32)).recent_failures, 0);
        assert!(!b.try_acquire_at(t0 + secs(33)).unwrap().is_trial());
    }

    #[test]
    fn test_failed_trial_doubles_cooldown_up_to_cap() {
        // ---
        let b = breaker();
        let t0 = Instant::now();
        for _ in 0..5 {
            b.try_acquire_at(t0).unwrap().fail_at(t0);
        }

        let mut now = t0 + secs(30);
        for cooldown in [60, 120, 240, 300, 300] {
            b.try_acquire_at(now).unwrap().fail_at(now);
            assert_eq!(
                b.state(),
                BreakerState::Open {
                    until: now + secs(cooldown)
                }
            );
            assert!(b.try_acquire_at(now + secs(cooldown - 1)).is_err());
            now += secs(cooldown);
        }
        assert_eq!(b.status_at(now).current_cooldown_secs, 300);
    }

    #[test]
    fn test_dropped_trial_permit_reopens() {
        // ---
        let b = breaker();
        let t0 = Instant::now();
        for _ in 0..5 {
            b.try_acquire_at(t0).unwrap().fail_at(t0);
        }
        let trial = b.try_acquire_at(t0 + secs(30)).unwrap();
        drop(trial);
        assert!(matches!(b.state(), BreakerState::Open { .. }));
    }

    #[test]
    fn test_late_failures_do_not_extend_open_state() {
        // ---
        let b = breaker();
        let t0 = Instant::now();
        let straggler = b.try_acquire_at(t0).unwrap();
        for _ in 0..5 {
            b.try_acquire_at(t0).unwrap().fail_at(t0);
        }
        let opened = b.state();
        straggler.fail_at(t0 + secs(10));
        assert_eq!(b.state(), opened);
    }
}
