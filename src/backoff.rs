//! Exponential backoff schedule for reconnect attempts.

use std::time::Duration;

/// Growth factor applied to the delay after each failed attempt.
const GROWTH_FACTOR: f64 = 1.5;

/// Reconnect delay schedule.
///
/// Fresh until the first failure, then grows by [`GROWTH_FACTOR`] per failed
/// attempt (rounded to whole milliseconds), capped at `max` when one is
/// configured. A successful connect resets the schedule.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    initial: Duration,
    max: Option<Duration>,
    current: Option<Duration>,
}

impl Backoff {
    pub(crate) fn new(initial: Duration, max: Option<Duration>) -> Self {
        Self {
            initial,
            max,
            current: None,
        }
    }

    /// Advance the schedule and return the delay to wait before the next
    /// attempt.
    pub(crate) fn next(&mut self) -> Duration {
        let next = match self.current {
            None => self.initial,
            Some(current) => {
                let millis = (current.as_millis() as f64 * GROWTH_FACTOR).round() as u64;
                let grown = Duration::from_millis(millis);
                match self.max {
                    Some(max) if grown > max => max,
                    _ => grown,
                }
            }
        };
        self.current = Some(next);
        next
    }

    /// Forget accumulated failures after a successful connect.
    pub(crate) fn reset(&mut self) {
        self.current = None;
    }

    /// True if at least one delay has been handed out since the last reset.
    pub(crate) fn in_progress(&self) -> bool {
        self.current.is_some()
    }
}
