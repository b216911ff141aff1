//! Wall-clock access for the time-driven evaluators.

use std::time::SystemTime;

/// Source of the current wall-clock time.
pub trait Clock {
    fn now(&self) -> SystemTime;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
