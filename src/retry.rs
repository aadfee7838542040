/// Bounded retry with exponential backoff.
///
/// A policy of `max_attempts = N` makes N-1 guarded attempts, sleeping
/// between them, followed by one final attempt whose result is returned
/// unchanged. Only errors of the configured [`FailureKind`] are retried;
/// anything else propagates from the attempt that produced it.
///
/// # Sleep injection
/// `run_with_sleep` takes the sleeper as a parameter so tests can record the
/// backoff schedule instead of blocking.

use std::time::Duration;

use crate::logging::{self, DataSource};
use crate::model::{BuoyError, FailureKind};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(3);
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of calls, including the final unguarded one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_multiplier: f64) -> Self {
        RetryPolicy {
            max_attempts,
            initial_delay,
            backoff_multiplier,
        }
    }

    /// Run `operation`, retrying errors of kind `retryable` with a blocking
    /// sleep on the calling thread.
    pub fn run<T, F>(&self, retryable: FailureKind, operation: F) -> Result<T, BuoyError>
    where
        F: FnMut() -> Result<T, BuoyError>,
    {
        self.run_with_sleep(retryable, operation, std::thread::sleep)
    }

    pub fn run_with_sleep<T, F, S>(
        &self,
        retryable: FailureKind,
        mut operation: F,
        mut sleep: S,
    ) -> Result<T, BuoyError>
    where
        F: FnMut() -> Result<T, BuoyError>,
        S: FnMut(Duration),
    {
        let mut remaining = self.max_attempts;
        let mut delay = self.initial_delay;

        while remaining > 1 {
            match operation() {
                Ok(value) => return Ok(value),
                Err(err) if err.kind() == retryable => {
                    logging::warn(
                        DataSource::System,
                        None,
                        &format!("{}. Retrying in {:.1} seconds.", err, delay.as_secs_f64()),
                    );
                    sleep(delay);
                    remaining -= 1;
                    if remaining > 1 {
                        delay = scale_delay(delay, self.backoff_multiplier);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        operation()
    }
}

/// `delay * multiplier`, saturating at `Duration::MAX`.
fn scale_delay(delay: Duration, multiplier: f64) -> Duration {
    Duration::try_from_secs_f64(delay.as_secs_f64() * multiplier).unwrap_or(Duration::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
