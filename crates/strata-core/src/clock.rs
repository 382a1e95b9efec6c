//! Clock abstraction for determinism.

use chrono::{DateTime, Utc};

/// Abstraction over system time for deterministic behavior.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Returns the current time, clamped so it is never older than `floor`.
    ///
    /// Models stamp new events with this so timestamps stay non-decreasing
    /// within an aggregate even when wall clocks step backwards.
    fn now_not_before(&self, floor: DateTime<Utc>) -> DateTime<Utc> {
        self.now().max(floor)
    }
}

/// Production clock that delegates to the system clock.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
