//! Exponential backoff with jitter for rate-limited backend calls.
//!
//! Retry logic lives here and nowhere else. Only `Error::RateLimited`
//! triggers a retry; every other error propagates immediately. Two profiles
//! exist: a permissive one for bulk metadata calls that attract HTTP 429,
//! and a minimal one for ordinary fetch/download calls.

use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::config::BackoffTuning;
use crate::error::Result;

/// Retry policy for one class of backend calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay baseline before the first retry.
    pub base_delay: Duration,
    /// Hard cap on any single delay.
    pub max_delay: Duration,
}

impl BackoffPolicy {
    /// Permissive profile for bulk calls prone to rate limiting.
    #[must_use]
    pub fn permissive(tuning: &BackoffTuning) -> Self {
        Self {
            max_attempts: tuning.max_attempts,
            base_delay: Duration::from_secs_f64(tuning.base_delay_secs),
            max_delay: Duration::from_secs_f64(tuning.max_delay_secs),
        }
    }

    /// Minimal profile for ordinary fetch/download calls.
    #[must_use]
    pub const fn minimal() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(20),
        }
    }

    /// Execute `op` under this policy, sleeping between rate-limited attempts.
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or the first
    /// non-rate-limited error immediately.
    pub fn run<T>(&self, op: impl FnMut() -> Result<T>) -> Result<T> {
        self.run_with_sleep(op, std::thread::sleep)
    }

    /// `run` with an injectable sleep, for tests that assert on delays.
    pub(crate) fn run_with_sleep<T>(
        &self,
        mut op: impl FnMut() -> Result<T>,
        mut sleep: impl FnMut(Duration),
    ) -> Result<T> {
        let mut base = self.base_delay;
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => {
                    if attempt > 0 {
                        info!(attempt = attempt + 1, "call succeeded after backoff");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_rate_limited() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay_for(base, attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_secs = delay.as_secs_f64(),
                        "rate limited; backing off"
                    );
                    sleep(delay);
                    // Adaptive increase: raise the baseline for the next
                    // attempt, never beyond the cap.
                    base = base.max(delay / 2).min(self.max_delay);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// `min(max_delay, base * 2^attempt * jitter)` with jitter in `[1.0, 1.6)`.
    fn delay_for(&self, base: Duration, attempt: u32) -> Duration {
        let jitter: f64 = rand::rng().random_range(1.0..1.6);
        let raw = base.as_secs_f64() * 2.0_f64.powi(attempt as i32) * jitter;
        Duration::from_secs_f64(raw).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn permissive_test_policy() -> BackoffPolicy {
        BackoffPolicy::permissive(&BackoffTuning::default())
    }

    #[test]
    fn test_success_passes_through() {
        let result = permissive_test_policy().run_with_sleep(|| Ok(7), |_| {});
        assert_eq!(result.ok(), Some(7));
    }

    #[test]
    fn test_network_error_is_not_retried() {
        let mut calls = 0;
        let result: Result<()> = permissive_test_policy().run_with_sleep(
            || {
                calls += 1;
                Err(Error::Network("down".to_string()))
            },
            |_| {},
        );
        assert!(matches!(result, Err(Error::Network(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_rate_limit_retries_with_non_decreasing_delays() {
        let mut calls = 0;
        let mut delays = Vec::new();
        let result = permissive_test_policy().run_with_sleep(
            || {
                calls += 1;
                if calls <= 2 {
                    Err(Error::RateLimited("429".to_string()))
                } else {
                    Ok("done")
                }
            },
            |d| delays.push(d),
        );
        assert_eq!(result.ok(), Some("done"));
        assert_eq!(calls, 3);
        assert_eq!(delays.len(), 2);
        assert!(delays[1] >= delays[0], "second delay must not shrink");
    }

    #[test]
    fn test_rate_limit_exhausts_attempts() {
        let mut calls = 0;
        let result: Result<()> = BackoffPolicy::minimal().run_with_sleep(
            || {
                calls += 1;
                Err(Error::RateLimited("429".to_string()))
            },
            |_| {},
        );
        assert!(matches!(result, Err(Error::RateLimited(_))));
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_delay_never_exceeds_cap() {
        let policy = BackoffPolicy {
            max_attempts: 8,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(20),
        };
        let mut delays = Vec::new();
        let _: Result<()> = policy.run_with_sleep(
            || Err(Error::RateLimited("429".to_string())),
            |d| delays.push(d),
        );
        assert_eq!(delays.len(), 7);
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(20)));
    }
}
