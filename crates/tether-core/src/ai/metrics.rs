//! AI manager counters.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attempts considered for the rolling error rate.
pub const ERROR_WINDOW: usize = 50;

/// Counters persisted with the AI manager state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AiMetrics {
    pub dispatched: u64,
    pub completed: u64,
    pub failed: u64,
    pub attempts: u64,
    pub attempt_failures: u64,
    /// Outcome of the most recent attempts, `true` for a failure.
    #[serde(default)]
    pub recent: VecDeque<bool>,
    #[serde(default)]
    pub total_latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_tick: Option<DateTime<Utc>>,
}

impl AiMetrics {
    pub fn record_attempt(&mut self, failed: bool, latency_ms: u64) {
        self.attempts += 1;
        self.total_latency_ms += latency_ms;
        if failed {
            self.attempt_failures += 1;
        }
        self.recent.push_back(failed);
        while self.recent.len() > ERROR_WINDOW {
            self.recent.pop_front();
        }
    }

    /// Failure share over the last [`ERROR_WINDOW`] attempts.
    pub fn error_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|failed| **failed).count();
        failures as f64 / self.recent.len() as f64
    }

    pub fn average_latency_ms(&self) -> u64 {
        if self.attempts == 0 {
            0
        } else {
            self.total_latency_ms / self.attempts
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rate_uses_recent_window() {
        let mut metrics = AiMetrics::default();
        for _ in 0..ERROR_WINDOW {
            metrics.record_attempt(true, 10);
        }
        assert!((metrics.error_rate() - 1.0).abs() < f64::EPSILON);

        for _ in 0..ERROR_WINDOW {
            metrics.record_attempt(false, 30);
        }
        assert_eq!(metrics.error_rate(), 0.0);
        assert_eq!(metrics.attempts, 100);
        assert_eq!(metrics.attempt_failures, 50);
        assert_eq!(metrics.average_latency_ms(), 20);
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = AiMetrics::default();
        assert_eq!(metrics.error_rate(), 0.0);
        assert_eq!(metrics.average_latency_ms(), 0);
    }
}
