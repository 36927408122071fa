//! Rolling daily quota for AI service attempts.
//!
//! The window opens at the first attempt after the previous one elapsed and
//! lasts 24 hours. Every network attempt consumes one unit, success or not.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Length of one quota window.
pub fn window_length() -> Duration {
    Duration::hours(24)
}

/// Persisted quota counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaWindow {
    pub used: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_start: Option<DateTime<Utc>>,
}

impl QuotaWindow {
    fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.window_start
            .is_some_and(|start| now - start >= window_length())
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        if self.is_elapsed(now) {
            self.used = 0;
            self.window_start = None;
        }
    }

    /// Units used in the window that is current at `now`.
    pub fn used_at(&self, now: DateTime<Utc>) -> u32 {
        if self.is_elapsed(now) { 0 } else { self.used }
    }

    pub fn is_exhausted(&self, limit: u32, now: DateTime<Utc>) -> bool {
        self.used_at(now) >= limit
    }

    /// Take one unit. Returns `false` (and takes nothing) when exhausted.
    pub fn try_consume(&mut self, limit: u32, now: DateTime<Utc>) -> bool {
        self.roll(now);
        if self.used >= limit {
            return false;
        }
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.used += 1;
        true
    }

    /// The service reported exhaustion: trust it for the rest of the window.
    pub fn mark_exhausted(&mut self, limit: u32, now: DateTime<Utc>) {
        self.roll(now);
        if self.window_start.is_none() {
            self.window_start = Some(now);
        }
        self.used = self.used.max(limit);
    }

    /// When the current window ends, if one is open.
    pub fn resets_at(&self) -> Option<DateTime<Utc>> {
        self.window_start.map(|start| start + window_length())
    }

    /// Fraction of the quota used, 0.0 to 1.0.
    pub fn utilization(&self, limit: u32, now: DateTime<Utc>) -> f64 {
        if limit == 0 {
            return 1.0;
        }
        (self.used_at(now) as f64 / limit as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_until_exhausted() {
        let now = Utc::now();
        let mut quota = QuotaWindow::default();
        assert!(quota.try_consume(2, now));
        assert!(quota.try_consume(2, now));
        assert!(!quota.try_consume(2, now));
        assert_eq!(quota.used, 2);
        assert!(quota.is_exhausted(2, now));
        assert_eq!(quota.resets_at(), Some(now + window_length()));
    }

    #[test]
    fn test_window_rolls_after_a_day() {
        let start = Utc::now();
        let mut quota = QuotaWindow::default();
        assert!(quota.try_consume(1, start));
        assert!(!quota.try_consume(1, start + Duration::hours(23)));

        let later = start + Duration::hours(24);
        assert!(!quota.is_exhausted(1, later));
        assert!(quota.try_consume(1, later));
        assert_eq!(quota.window_start, Some(later));
    }

    #[test]
    fn test_mark_exhausted_and_utilization() {
        let now = Utc::now();
        let mut quota = QuotaWindow::default();
        assert!(quota.try_consume(10, now));
        assert!((quota.utilization(10, now) - 0.1).abs() < f64::EPSILON);

        quota.mark_exhausted(10, now);
        assert!(quota.is_exhausted(10, now));
        assert!((quota.utilization(10, now) - 1.0).abs() < f64::EPSILON);
    }
}
