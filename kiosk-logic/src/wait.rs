//! Dispatch results and bounded waits
//!
//! Every dispatch step returns a [`Step`] to the driving loop instead of
//! unwinding out of it. Waiting for "the next signal" is a retry loop around
//! a check function that polls for one slice and reports [`WaitCheck`].

use std::time::{Duration, Instant};
use thiserror::Error;

/// Outcome of one dispatch step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Work was done, call again
    Continue,
    /// Nothing to do this tick
    Idle,
    /// Peer asked us to exit
    Stop,
    /// Unrecoverable local failure
    Error(String),
}

impl Step {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Step::Stop | Step::Error(_))
    }
}

/// Retry count and per-retry slice for a bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl WaitPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }

    /// Upper bound of the whole wait
    pub fn budget(&self) -> Duration {
        self.delay * (self.retries + 1)
    }
}

impl Default for WaitPolicy {
    /// 60 x 1 s, the per-cycle default
    fn default() -> Self {
        Self::new(60, Duration::from_secs(1))
    }
}

/// Result of one check inside a bounded wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitCheck<T> {
    /// Nothing yet, try again
    Empty,
    Ready(T),
    /// The peer went away, retrying is pointless
    Lost,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    #[error("No answer after {attempts} attempts ({waited:?})")]
    Timeout { attempts: u32, waited: Duration },

    #[error("Connection lost while waiting")]
    ConnectionLost,
}

/// Call `check` up to `retries + 1` times, handing it the slice to poll for.
pub fn wait_until<T>(
    policy: WaitPolicy,
    mut check: impl FnMut(Duration) -> WaitCheck<T>,
) -> Result<T, WaitError> {
    let started = Instant::now();
    let attempts = policy.retries + 1;
    for _ in 0..attempts {
        match check(policy.delay) {
            WaitCheck::Ready(value) => return Ok(value),
            WaitCheck::Lost => return Err(WaitError::ConnectionLost),
            WaitCheck::Empty => {}
        }
    }
    Err(WaitError::Timeout {
        attempts,
        waited: started.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_on_third_attempt() {
        let mut calls = 0;
        let value = wait_until(WaitPolicy::new(5, Duration::ZERO), |_| {
            calls += 1;
            if calls == 3 {
                WaitCheck::Ready("done")
            } else {
                WaitCheck::Empty
            }
        });
        assert_eq!(value, Ok("done"));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_timeout_counts_attempts() {
        let mut calls = 0;
        let result: Result<(), _> = wait_until(WaitPolicy::new(2, Duration::ZERO), |_| {
            calls += 1;
            WaitCheck::Empty
        });
        assert!(matches!(result, Err(WaitError::Timeout { attempts: 3, .. })));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_lost_stops_early() {
        let mut calls = 0;
        let result: Result<(), _> = wait_until(WaitPolicy::new(10, Duration::ZERO), |_| {
            calls += 1;
            WaitCheck::Lost
        });
        assert_eq!(result, Err(WaitError::ConnectionLost));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_budget() {
        let policy = WaitPolicy::new(19, Duration::from_secs(5));
        assert_eq!(policy.budget(), Duration::from_secs(100));
    }
}
