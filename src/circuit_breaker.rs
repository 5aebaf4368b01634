//! Consecutive-failure circuit breaker
//!
//! ```text
//!                 failures >= threshold
//!   ┌────────┐ ────────────────────────▶ ┌──────┐
//!   │ Closed │                            │ Open │ ◀──┐
//!   └────────┘ ◀──┐                       └──────┘    │
//!                 │ success                   │       │ failure
//!                 │           first call after│       │
//!                 │           recovery_timeout▼       │
//!                 │                      ┌──────────┐ │
//!                 └──────────────────────│ HalfOpen │─┘
//!                                        └──────────┘
//! ```
//!
//! Open → HalfOpen happens lazily inside [`CircuitBreaker::try_acquire`];
//! nothing runs on a timer. The breaker performs no I/O: the caller asks
//! for a permit, runs the protected operation, and reports exactly one
//! outcome back.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{RelayError, RelayResult};

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent Open before a trial call is allowed
    pub recovery_timeout: Duration,
    /// Trial calls allowed while HalfOpen
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }
}

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls fail fast
    Open,
    /// A bounded number of trial calls pass through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker over one remote dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_calls: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_calls: 0,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Last settled state; an expired Open only turns HalfOpen on the next
    /// [`try_acquire`](Self::try_acquire)
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }

    /// Ask permission for one call.
    ///
    /// Returns [`RelayError::CircuitOpen`] while Open and before the
    /// recovery timeout, or when the HalfOpen trial budget is spent.
    pub fn try_acquire(&mut self) -> RelayResult<()> {
        if self.state == CircuitState::Open {
            let elapsed = self.opened_at.map(|t| t.elapsed()).unwrap_or_default();
            if elapsed < self.config.recovery_timeout {
                return Err(RelayError::CircuitOpen {
                    retry_in_ms: (self.config.recovery_timeout - elapsed).as_millis() as u64,
                });
            }
            info!(
                failures = self.consecutive_failures,
                "Circuit breaker half-open, trying recovery"
            );
            self.state = CircuitState::HalfOpen;
            self.half_open_calls = 0;
        }

        if self.state == CircuitState::HalfOpen {
            if self.half_open_calls >= self.config.half_open_max_calls {
                return Err(RelayError::CircuitOpen {
                    retry_in_ms: self.config.recovery_timeout.as_millis() as u64,
                });
            }
            self.half_open_calls += 1;
        }

        Ok(())
    }

    pub fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            info!("Circuit breaker closed after successful trial call");
        }
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open_calls = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            CircuitState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                warn!(
                    failures = self.consecutive_failures,
                    recovery_ms = self.config.recovery_timeout.as_millis() as u64,
                    "Circuit breaker opened"
                );
                self.open();
            },
            CircuitState::HalfOpen => {
                warn!("Circuit breaker trial call failed, reopening");
                self.open();
            },
            _ => {},
        }
    }

    /// Hand back a permit that produced no outcome. A HalfOpen trial slot
    /// is returned; counters are untouched.
    pub fn release(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.half_open_calls = self.half_open_calls.saturating_sub(1);
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_calls = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_recovery_timeout(Duration::from_secs(10)),
        )
    }

    #[test]
    fn test_starts_closed() {
        let mut cb = breaker(3);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold() {
        let mut cb = breaker(3);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let err = cb.try_acquire().unwrap_err();
        assert!(matches!(err, RelayError::CircuitOpen { retry_in_ms } if retry_in_ms == 10_000));
    }

    #[test]
    fn test_success_resets_failures() {
        let mut cb = breaker(3);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_open_until_recovery_timeout() {
        let mut cb = breaker(1);
        cb.record_failure();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_budget() {
        let mut cb = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_secs(1))
                .with_half_open_max_calls(2),
        );
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;

        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_ok());
        assert!(cb.try_acquire().is_err());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let mut cb = breaker(2);
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        cb.try_acquire().unwrap();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens_with_fresh_timer() {
        let mut cb = breaker(2);
        cb.record_failure();
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(10)).await;

        cb.try_acquire().unwrap();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Open-time was reset by the failed trial call
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_released_slot_can_be_reused() {
        let mut cb = CircuitBreaker::new(
            CircuitBreakerConfig::default()
                .with_failure_threshold(1)
                .with_recovery_timeout(Duration::from_secs(1))
                .with_half_open_max_calls(1),
        );
        cb.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;

        cb.try_acquire().unwrap();
        assert!(cb.try_acquire().is_err());
        cb.release();
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.failure_count(), 1);
    }
}
