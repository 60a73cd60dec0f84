//! Three-state circuit breaker wrapping every Exchange Client call (§4.1).
//!
//! State machine shape mirrors the connection-session state machines in the
//! teacher's scraper layer: an explicit enum, a small set of named
//! transition triggers, and all mutation funneled through one type.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(60),
            half_open_success_threshold: 3,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    next_attempt: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            next_attempt: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Whether a call is currently admitted. Transitions OPEN -> HALF_OPEN
    /// when the cooldown has elapsed.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if self.next_attempt.is_some_and(|t| now >= t) {
                    self.state = CircuitState::HalfOpen;
                    self.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn on_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.config.half_open_success_threshold {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    self.next_attempt = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn on_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
            CircuitState::HalfOpen => {
                self.trip(now);
            }
            CircuitState::Open => {
                self.next_attempt = Some(now + self.config.open_duration);
            }
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.next_attempt = Some(now + self.config.open_duration);
    }

    /// Reset to CLOSED unconditionally - used by Rate Governor recovery
    /// (§4.1: the recovery task resets the circuit breaker).
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.next_attempt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_failures() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..Default::default()
        });
        let now = Instant::now();
        for _ in 0..2 {
            cb.on_failure(now);
            assert_eq!(cb.state(), CircuitState::Closed);
        }
        cb.on_failure(now);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn open_fails_fast_until_deadline_then_half_opens() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(60),
            ..Default::default()
        });
        let t0 = Instant::now();
        cb.on_failure(t0);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow(t0 + Duration::from_secs(30)));
        assert!(cb.allow(t0 + Duration::from_secs(61)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_k_successes() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::ZERO,
            half_open_success_threshold: 2,
        });
        let t0 = Instant::now();
        cb.on_failure(t0);
        assert!(cb.allow(t0));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_and_extends_deadline() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            open_duration: Duration::from_secs(10),
            ..Default::default()
        });
        let t0 = Instant::now();
        cb.on_failure(t0);
        assert!(cb.allow(t0 + Duration::from_secs(11)));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.on_failure(t0 + Duration::from_secs(11));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow(t0 + Duration::from_secs(15)));
    }
}
