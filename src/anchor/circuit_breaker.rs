//! Circuit breaker pattern for anchor backends.
//!
//! Stops calls to a backend that keeps failing until a cooldown elapses,
//! then lets a single trial through.

use crate::anchor::config::CircuitBreakerConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::{info, warn};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,

    /// Requests are skipped until the cooldown elapses.
    Open,

    /// One trial request is allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    last_transition: DateTime<Utc>,
}

/// Circuit breaker for a single backend.
pub struct CircuitBreaker {
    backend: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(backend: &str, config: CircuitBreakerConfig) -> Self {
        Self {
            backend: backend.to_string(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                last_transition: Utc::now(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cooled_down(&self, state: &BreakerState) -> bool {
        state
            .opened_at
            .map(|at| at.elapsed() >= self.config.reset_timeout())
            .unwrap_or(true)
    }

    /// Current state. An open circuit whose cooldown has elapsed reports
    /// `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        let state = self.lock();
        match state.state {
            CircuitState::Open if self.cooled_down(&state) => CircuitState::HalfOpen,
            other => other,
        }
    }

    /// Admit a call if the circuit allows it. In half-open state only one
    /// trial is admitted until its permit reports back or is dropped.
    pub fn try_acquire(&self) -> Option<BreakerPermit<'_>> {
        self.admit().then_some(BreakerPermit {
            breaker: self,
            reported: false,
        })
    }

    fn admit(&self) -> bool {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if !self.cooled_down(&state) {
                    return false;
                }
                info!(backend = %self.backend, "Circuit breaker half-open, allowing trial");
                self.transition(&mut state, CircuitState::HalfOpen);
                state.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    false
                } else {
                    state.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// A call was admitted but never reported. An abandoned trial re-opens
    /// the circuit so a later trial can be admitted after the cooldown.
    fn abandon(&self) {
        let mut state = self.lock();
        if state.state == CircuitState::HalfOpen && state.trial_in_flight {
            warn!(backend = %self.backend, "Circuit breaker trial abandoned, re-opening");
            self.transition(&mut state, CircuitState::Open);
        }
    }

    /// Record a successful call; closes the circuit.
    fn record_success(&self) {
        let mut state = self.lock();
        if state.state != CircuitState::Closed {
            info!(backend = %self.backend, "Circuit breaker closing after success");
            self.transition(&mut state, CircuitState::Closed);
        }
        state.consecutive_failures = 0;
    }

    /// Record a failed call.
    fn record_failure(&self) {
        let mut state = self.lock();
        state.consecutive_failures += 1;
        match state.state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.fail_max {
                    warn!(
                        backend = %self.backend,
                        failures = state.consecutive_failures,
                        "Circuit breaker opening"
                    );
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(backend = %self.backend, "Circuit breaker re-opening after failed trial");
                self.transition(&mut state, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let current = self.state();
        let state = self.lock();
        CircuitBreakerStats {
            backend: self.backend.clone(),
            state: current,
            consecutive_failures: state.consecutive_failures,
            last_transition: state.last_transition,
        }
    }

    fn transition(&self, state: &mut BreakerState, new_state: CircuitState) {
        state.state = new_state;
        state.last_transition = Utc::now();
        state.trial_in_flight = false;
        state.opened_at = match new_state {
            CircuitState::Open => Some(Instant::now()),
            _ => None,
        };
    }
}

/// An admitted call. Report the outcome with [`BreakerPermit::success`] or
/// [`BreakerPermit::failure`]; dropping it unreported abandons the call.
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    reported: bool,
}

impl BreakerPermit<'_> {
    pub fn success(mut self) {
        self.reported = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.reported = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.reported {
            self.breaker.abandon();
        }
    }
}

/// Statistics for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub backend: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            fail_max: 3,
            reset_timeout_ms: 50,
        }
    }

    #[test]
    fn test_closed_to_open() {
        let breaker = CircuitBreaker::new("b", test_config());
        assert!(breaker.try_acquire().is_some());

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[test]
    fn test_success_resets_failures() {
        let breaker = CircuitBreaker::new("b", test_config());
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 2);
    }

    #[test]
    fn test_half_open_single_trial() {
        let breaker = CircuitBreaker::new("b", test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(70));

        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        let trial = breaker.try_acquire().unwrap();
        assert!(breaker.try_acquire().is_none());

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_acquire().is_some());
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("b", test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(70));
        breaker.try_acquire().unwrap().failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());
    }

    #[test]
    fn test_dropped_trial_reopens() {
        let breaker = CircuitBreaker::new("b", test_config());
        for _ in 0..3 {
            breaker.record_failure();
        }
        std::thread::sleep(Duration::from_millis(70));

        let trial = breaker.try_acquire().unwrap();
        drop(trial);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_none());

        std::thread::sleep(Duration::from_millis(70));
        let trial = breaker.try_acquire().unwrap();
        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_dropped_permit_when_closed() {
        let breaker = CircuitBreaker::new("b", test_config());
        drop(breaker.try_acquire());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);
    }
}
