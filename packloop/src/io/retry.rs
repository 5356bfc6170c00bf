//! Retry with exponential backoff for oracle calls.

use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, warn};

/// How often and how patiently to retry a failing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled before each further retry.
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            max_attempts,
            initial_backoff,
        }
    }

    fn backoff_before(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff.saturating_mul(factor)
    }
}

/// Call `op` until it succeeds or the policy's attempts run out.
///
/// `op` receives the 1-based attempt number. The last error is returned.
pub fn with_retry<T, F>(label: &str, policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Result<T>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(label, attempt, max_attempts, err = %format!("{err:#}"), "attempt failed");
                last_error = Some(err);
                if attempt < max_attempts {
                    let backoff = policy.backoff_before(attempt);
                    info!(
                        label,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying after backoff"
                    );
                    thread::sleep(backoff);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("{label}: no attempts made")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_first_success() {
        let mut calls = Vec::new();
        let value = with_retry("test", RetryPolicy::new(3, Duration::ZERO), |attempt| {
            calls.push(attempt);
            if attempt < 2 {
                Err(anyhow!("flaky"))
            } else {
                Ok(attempt * 10)
            }
        })
        .expect("retry");
        assert_eq!(value, 20);
        assert_eq!(calls, vec![1, 2]);
    }

    #[test]
    fn returns_last_error_when_exhausted() {
        let err = with_retry::<(), _>("test", RetryPolicy::new(3, Duration::ZERO), |attempt| {
            Err(anyhow!("failure {attempt}"))
        })
        .unwrap_err();
        assert_eq!(err.to_string(), "failure 3");
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _ = with_retry::<(), _>("test", RetryPolicy::new(0, Duration::ZERO), |_| {
            calls += 1;
            Err(anyhow!("nope"))
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.backoff_before(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_before(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_before(3), Duration::from_millis(400));
    }
}
