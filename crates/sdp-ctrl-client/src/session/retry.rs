//! Retry deadline and escalation policy.
//!
//! Pure functions of wall-clock time and the episode counters; the session
//! owns the counters and applies the decision.

use std::time::{Duration, SystemTime};

/// What to do with an outstanding request at `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The retry deadline has not passed yet.
    NotDue,
    /// Re-issue the request and wait `next_interval` for the next deadline.
    Retry { next_interval: Duration },
    /// Attempts exhausted; the episode is a terminal failure.
    Escalate,
}

/// Retry limits for request episodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(initial_interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial_interval,
            max_attempts,
        }
    }

    /// Decide on an outstanding request sent at `last_req_time`, `attempts`
    /// times so far, currently waiting `interval`.
    ///
    /// The interval doubles without an upper bound; `max_attempts` bounds the
    /// total wait.
    pub fn evaluate(
        &self,
        now: SystemTime,
        last_req_time: SystemTime,
        interval: Duration,
        attempts: u32,
    ) -> RetryDecision {
        if !is_due(now, last_req_time, interval) {
            return RetryDecision::NotDue;
        }
        if attempts >= self.max_attempts {
            return RetryDecision::Escalate;
        }
        RetryDecision::Retry {
            next_interval: interval.saturating_mul(2),
        }
    }
}

/// Whether `now` is at or past `since + interval`.
///
/// A deadline that overflows the clock never comes due.
pub fn is_due(now: SystemTime, since: SystemTime, interval: Duration) -> bool {
    since.checked_add(interval).is_some_and(|deadline| now >= deadline)
}
