//! Circuit breaker pattern for failure detection and recovery.
//!
//! Wraps emit and dispatch sites: repeated or high-rate failures open the
//! circuit, a cooldown probe half-opens it, and sustained successes close
//! it again. Slow calls count toward their own rate threshold.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::domain::errors::{RuntimeError, RuntimeResult};

/// Configuration for an emit-site circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit outright.
    pub failure_threshold: u32,
    /// Failure fraction over the rolling volume that opens the circuit.
    pub failure_rate_threshold: f64,
    /// Minimum calls in the rolling window before rates are evaluated.
    pub request_volume_threshold: usize,
    /// Per-call timeout in milliseconds (advisory for wrapped calls).
    pub timeout_ms: u64,
    /// Time the circuit stays open before a half-open probe.
    pub reset_timeout_ms: u64,
    /// Closed-state failure history is forgotten after this long.
    pub cooldown_period_ms: u64,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
    /// Calls slower than this count as slow.
    pub slow_call_duration_threshold_ms: u64,
    /// Slow-call fraction over the rolling volume that opens the circuit.
    pub slow_call_rate_threshold: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.8,
            request_volume_threshold: 10,
            timeout_ms: 10_000,
            reset_timeout_ms: 30_000,
            cooldown_period_ms: 60_000,
            success_threshold: 3,
            slow_call_duration_threshold_ms: 5_000,
            slow_call_rate_threshold: 0.7,
        }
    }
}

/// State of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are blocked.
    Open,
    /// Probing recovery.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// One recorded call outcome in the rolling window.
#[derive(Debug, Clone, Copy)]
struct CallRecord {
    at: Instant,
    failed: bool,
    slow: bool,
}

/// Statistics for status surfaces and tests.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    pub window_calls: usize,
    pub window_failures: usize,
    pub window_slow_calls: usize,
    pub open_count: u32,
}

/// Failure-rate breaker guarding a single emit/dispatch site.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    records: VecDeque<CallRecord>,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    open_count: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            records: VecDeque::new(),
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            open_count: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Check whether a call may proceed, transitioning open → half-open
    /// once the reset timeout has elapsed.
    pub fn check(&mut self) -> RuntimeResult<()> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> RuntimeResult<()> {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let reset = Duration::from_millis(self.config.reset_timeout_ms);
                if let Some(opened_at) = self.opened_at {
                    let elapsed = now.duration_since(opened_at);
                    if elapsed >= reset {
                        self.state = CircuitState::HalfOpen;
                        self.half_open_successes = 0;
                        return Ok(());
                    }
                    return Err(RuntimeError::CircuitOpen {
                        retry_after_ms: (reset - elapsed).as_millis() as u64,
                    });
                }
                Err(RuntimeError::CircuitOpen {
                    retry_after_ms: self.config.reset_timeout_ms,
                })
            }
        }
    }

    /// Record a successful call with its duration.
    pub fn record_success(&mut self, duration: Duration) {
        self.record_success_at(duration, Instant::now());
    }

    pub fn record_success_at(&mut self, duration: Duration, now: Instant) {
        let slow = duration.as_millis() as u64 > self.config.slow_call_duration_threshold_ms;
        self.push_record(CallRecord {
            at: now,
            failed: false,
            slow,
        });
        self.consecutive_failures = 0;

        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.success_threshold {
                    self.close();
                }
            }
            CircuitState::Closed => {
                // A flood of slow successes still degrades the site.
                if self.slow_rate_exceeded() {
                    self.open(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self) {
        self.record_failure_at(Instant::now());
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.push_record(CallRecord {
            at: now,
            failed: true,
            slow: false,
        });
        self.consecutive_failures += 1;

        match self.state {
            CircuitState::HalfOpen => self.open(now),
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold
                    || self.failure_rate_exceeded()
                {
                    self.open(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn push_record(&mut self, record: CallRecord) {
        let cooldown = Duration::from_millis(self.config.cooldown_period_ms);
        while let Some(front) = self.records.front() {
            if record.at.duration_since(front.at) > cooldown {
                self.records.pop_front();
            } else {
                break;
            }
        }
        self.records.push_back(record);
        // Rolling volume is bounded by the request volume threshold.
        while self.records.len() > self.config.request_volume_threshold {
            self.records.pop_front();
        }
    }

    fn failure_rate_exceeded(&self) -> bool {
        if self.records.len() < self.config.request_volume_threshold {
            return false;
        }
        let failures = self.records.iter().filter(|r| r.failed).count();
        failures as f64 / self.records.len() as f64 >= self.config.failure_rate_threshold
    }

    fn slow_rate_exceeded(&self) -> bool {
        if self.records.len() < self.config.request_volume_threshold {
            return false;
        }
        let slow = self.records.iter().filter(|r| r.slow).count();
        slow as f64 / self.records.len() as f64 >= self.config.slow_call_rate_threshold
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.half_open_successes = 0;
        self.open_count += 1;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.records.clear();
    }

    /// Manually reset to closed.
    pub fn reset(&mut self) {
        self.close();
        self.open_count = 0;
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state.as_str(),
            consecutive_failures: self.consecutive_failures,
            half_open_successes: self.half_open_successes,
            window_calls: self.records.len(),
            window_failures: self.records.iter().filter(|r| r.failed).count(),
            window_slow_calls: self.records.iter().filter(|r| r.slow).count(),
            open_count: self.open_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            success_threshold,
            ..Default::default()
        })
    }

    #[test]
    fn test_opens_on_consecutive_failures() {
        let mut cb = breaker(3, 2);
        let now = Instant::now();

        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check_at(now).is_err());
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let mut cb = breaker(3, 2);
        let now = Instant::now();

        cb.record_failure_at(now);
        cb.record_failure_at(now);
        cb.record_success_at(Duration::from_millis(1), now);
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_opens_on_failure_rate() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 100,
            failure_rate_threshold: 0.8,
            request_volume_threshold: 10,
            ..Default::default()
        });
        let now = Instant::now();

        // 2 successes then failures, never 100 consecutive, but the rate
        // over the 10-call volume crosses 0.8.
        cb.record_success_at(Duration::from_millis(1), now);
        cb.record_success_at(Duration::from_millis(1), now);
        for _ in 0..9 {
            cb.record_failure_at(now);
            if cb.state() == CircuitState::Open {
                break;
            }
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_after_reset_timeout() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 100,
            success_threshold: 2,
            ..Default::default()
        });
        let start = Instant::now();

        cb.record_failure_at(start);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check_at(start + Duration::from_millis(10)).is_err());

        cb.check_at(start + Duration::from_millis(150)).unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let later = start + Duration::from_millis(160);
        cb.record_success_at(Duration::from_millis(1), later);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success_at(Duration::from_millis(1), later);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 50,
            ..Default::default()
        });
        let start = Instant::now();

        cb.record_failure_at(start);
        cb.check_at(start + Duration::from_millis(60)).unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure_at(start + Duration::from_millis(61));
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.stats().open_count, 2);
    }

    #[test]
    fn test_slow_calls_open_circuit() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 100,
            request_volume_threshold: 10,
            slow_call_duration_threshold_ms: 100,
            slow_call_rate_threshold: 0.7,
            ..Default::default()
        });
        let now = Instant::now();

        for _ in 0..10 {
            cb.record_success_at(Duration::from_millis(500), now);
            if cb.state() == CircuitState::Open {
                break;
            }
        }
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_reset() {
        let mut cb = breaker(1, 1);
        let now = Instant::now();
        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.stats().open_count, 0);
        cb.check_at(now).unwrap();
    }

    #[test]
    fn test_retry_after_reported() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout_ms: 30_000,
            ..Default::default()
        });
        let now = Instant::now();
        cb.record_failure_at(now);

        match cb.check_at(now + Duration::from_millis(10_000)) {
            Err(RuntimeError::CircuitOpen { retry_after_ms }) => {
                assert!(retry_after_ms <= 20_000 && retry_after_ms > 19_000);
            }
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
    }
}
