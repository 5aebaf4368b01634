//! Command statistics
//!
//! Counters are updated by the connection manager once per logical
//! command, inside the per-hub exclusive section, and read through cheap
//! clones.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Weight of the newest sample in the rolling response-time average
const RESPONSE_TIME_ALPHA: f64 = 0.2;

/// Per-hub command counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct CommandStats {
    /// Commands handed to the manager (circuit rejections included)
    pub total_commands: u64,
    pub successful_commands: u64,
    pub failed_commands: u64,
    /// Fast-failed by an open circuit, never sent
    pub rejected_commands: u64,
    /// Extra attempts beyond the first, across all commands
    pub retried_attempts: u64,
    /// Streams opened after the first one
    pub reconnects: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Exponentially weighted average of successful round trips
    pub avg_response_time_ms: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl CommandStats {
    /// Successful fraction of commands that reached the wire
    pub fn success_rate(&self) -> f64 {
        let attempted = self.successful_commands + self.failed_commands;
        if attempted == 0 {
            return 0.0;
        }
        self.successful_commands as f64 / attempted as f64
    }

    pub(crate) fn record_success(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.avg_response_time_ms = if self.successful_commands == 0 {
            ms
        } else {
            RESPONSE_TIME_ALPHA * ms + (1.0 - RESPONSE_TIME_ALPHA) * self.avg_response_time_ms
        };
        self.total_commands += 1;
        self.successful_commands += 1;
        self.last_success = Some(Utc::now());
    }

    pub(crate) fn record_failure(&mut self, error: &str) {
        self.total_commands += 1;
        self.failed_commands += 1;
        self.last_error = Some(error.to_string());
    }

    pub(crate) fn record_rejected(&mut self) {
        self.total_commands += 1;
        self.rejected_commands += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rolling_average() {
        let mut stats = CommandStats::default();
        stats.record_success(Duration::from_millis(100));
        assert_eq!(stats.avg_response_time_ms, 100.0);

        stats.record_success(Duration::from_millis(200));
        assert!((stats.avg_response_time_ms - 120.0).abs() < 1e-9);
        assert!(stats.last_success.is_some());
    }

    #[test]
    fn test_success_rate_ignores_rejections() {
        let mut stats = CommandStats::default();
        assert_eq!(stats.success_rate(), 0.0);

        stats.record_success(Duration::from_millis(5));
        stats.record_failure("timeout");
        stats.record_rejected();
        assert_eq!(stats.total_commands, 3);
        assert_eq!(stats.success_rate(), 0.5);
        assert_eq!(stats.last_error.as_deref(), Some("timeout"));
    }
}
