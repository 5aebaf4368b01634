//! Exponential backoff with optional full jitter

use std::time::Duration;

use rand::Rng;

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial try
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied per retry
    pub backoff_factor: f64,
    /// Draw each delay uniformly from `[0, delay]`
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Decides whether and when to retry.
///
/// Pure apart from the jitter draw; holds no per-call state, so one policy
/// serves every call made through a connection manager.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Total tries a call may make, the initial one included
    pub fn max_tries(&self) -> u32 {
        self.config.max_attempts.saturating_add(1)
    }

    /// Delay before retry number `attempt` (1-based), or `None` once the
    /// retry budget is spent.
    ///
    /// The un-jittered delay is `min(base * factor^(attempt-1), max)`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_attempts {
            return None;
        }
        let delay = self.backoff(attempt);
        if self.config.jitter {
            Some(jittered(delay))
        } else {
            Some(delay)
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.config.base_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();
        let secs = (base * self.config.backoff_factor.powi(exponent)).min(max);
        if secs.is_finite() && secs >= 0.0 {
            Duration::from_secs_f64(secs).min(self.config.max_delay)
        } else {
            self.config.max_delay
        }
    }
}

fn jittered(delay: Duration) -> Duration {
    let secs = rand::thread_rng().gen_range(0.0..=delay.as_secs_f64());
    Duration::from_secs_f64(secs).min(delay)
}
