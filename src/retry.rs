//! Bounded retry combinator shared by health waits, termination waits and
//! deploy verification.
use std::{thread, time::Duration};

/// Result of a bounded retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// The attempt function produced a value on the given (1-based) attempt.
    Ready { value: T, attempt: usize },
    /// Every attempt was exhausted.
    TimedOut { attempts: usize },
}

impl<T> RetryOutcome<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            RetryOutcome::Ready { value, .. } => Some(value),
            RetryOutcome::TimedOut { .. } => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, RetryOutcome::Ready { .. })
    }
}

/// Calls `attempt` up to `max_attempts` times, sleeping `interval` between
/// attempts (not after the last one). `attempt` receives the 1-based attempt
/// number and returns `Some` to stop.
pub fn retry_with_interval<T, F>(
    interval: Duration,
    max_attempts: usize,
    mut attempt: F,
) -> RetryOutcome<T>
where
    F: FnMut(usize) -> Option<T>,
{
    let max_attempts = max_attempts.max(1);
    for number in 1..=max_attempts {
        if let Some(value) = attempt(number) {
            return RetryOutcome::Ready {
                value,
                attempt: number,
            };
        }

        if number != max_attempts {
            thread::sleep(interval);
        }
    }

    RetryOutcome::TimedOut {
        attempts: max_attempts,
    }
}

/// Number of attempts that fit in `budget` at the given `interval`.
pub fn attempts_for(budget: Duration, interval: Duration) -> usize {
    if interval.is_zero() {
        return 1;
    }
    ((budget.as_millis() / interval.as_millis().max(1)) as usize).max(1)
}
