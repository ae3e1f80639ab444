//! Bounded polling used wherever a state change has to be observed rather
//! than assumed: admin state, device reappearance, daemon liveness.

use std::thread;
use std::time::Duration;

use crate::error::Result;

/// How many times to check, and how long to wait between checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
    /// Multiplier applied to the interval after each miss. `1.0` is fixed.
    pub backoff: f64,
    pub max_interval: Duration,
}

/// The predicate never held within the policy's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimeout {
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(10, Duration::from_millis(500))
    }
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts,
            interval,
            backoff: 1.0,
            max_interval: interval,
        }
    }

    pub fn with_backoff(mut self, factor: f64, max_interval: Duration) -> Self {
        self.backoff = if factor.is_finite() && factor >= 1.0 {
            factor
        } else {
            1.0
        };
        self.max_interval = max_interval.max(self.interval);
        self
    }

    /// Checks `predicate` until it returns `Ok(true)` or the attempt budget
    /// runs out. Returns the number of checks it took.
    ///
    /// A predicate error counts as a miss: the thing being polled is often
    /// briefly unreadable mid-transition (a device node that has not been
    /// recreated yet, for example).
    pub fn poll<F>(&self, what: &str, mut predicate: F) -> std::result::Result<u32, PollTimeout>
    where
        F: FnMut() -> Result<bool>,
    {
        let attempts = self.attempts.max(1);
        let mut delay = self.interval;

        for attempt in 1..=attempts {
            match predicate() {
                Ok(true) => {
                    tracing::trace!(what, attempt, "poll satisfied");
                    return Ok(attempt);
                }
                Ok(false) => {}
                Err(err) => tracing::debug!(what, attempt, error = %err, "poll check failed"),
            }

            if attempt < attempts && !delay.is_zero() {
                thread::sleep(delay);
                delay = self.next_delay(delay);
            }
        }

        Err(PollTimeout { attempts })
    }

    fn next_delay(&self, current: Duration) -> Duration {
        if self.backoff <= 1.0 {
            return current;
        }
        current.mul_f64(self.backoff).min(self.max_interval)
    }
}

/// Sleeps unless the duration is zero. Keeps test configurations instant.
pub(crate) fn settle(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}
