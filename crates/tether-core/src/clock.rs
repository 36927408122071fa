//! Time source injected into the managers and the orchestrator.
//!
//! Quota windows, staleness checks and directive deadlines all read the
//! clock through this trait so tests can move time by hand.

use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Source of "now".
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// Default shared wall clock.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

#[cfg(test)]
pub use manual::ManualClock;

#[cfg(test)]
mod manual {
    use super::*;
    use std::sync::Mutex;

    /// Clock that only moves when told to.
    #[derive(Debug)]
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new(start: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                now: Mutex::new(start),
            })
        }

        pub fn starting_now() -> Arc<Self> {
            Self::new(Utc::now())
        }

        pub fn advance(&self, by: chrono::Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::starting_now();
        let start = clock.now();
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(clock.now() - start, chrono::Duration::minutes(5));
    }
}
