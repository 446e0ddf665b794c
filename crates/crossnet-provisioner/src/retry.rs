//! Bounded retry with exponential backoff
//!
//! No jitter: the total wait of a policy is a fixed, known bound.

use std::time::Duration;

use tracing::{error, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first, at least 1
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: u32,
}

impl RetryPolicy {
    /// Subnet deletion while serverless address reservations drain:
    /// 6 attempts, waiting 10, 20, 40, 80 and 160 seconds in between
    pub fn subnet_release() -> Self {
        Self {
            max_attempts: 6,
            initial_delay: Duration::from_secs(10),
            backoff_multiplier: 2,
        }
    }

    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Self::subnet_release()
        }
    }

    /// Delay before attempt `n + 1`, for `n` starting at 1
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }

    /// Sum of all waits when every attempt fails
    pub fn total_wait(&self) -> Duration {
        (1..self.max_attempts.max(1))
            .map(|n| self.delay_after(n))
            .sum()
    }
}

/// Run `operation` until it succeeds or the policy is exhausted,
/// returning the last error together with the number of attempts made
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err((e, attempt));
                }

                let delay = policy.delay_after(attempt);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_secs = delay.as_secs(),
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_subnet_release_bound() {
        let policy = RetryPolicy::subnet_release();
        assert_eq!(policy.delay_after(1), Duration::from_secs(10));
        assert_eq!(policy.delay_after(5), Duration::from_secs(160));
        assert_eq!(policy.total_wait(), Duration::from_secs(310));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<u32, (String, u32)> =
            retry_with_backoff(&RetryPolicy::subnet_release(), "op", || {
                let c = c.clone();
                async move {
                    let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(format!("resource in use ({})", n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_bounded() {
        let policy = RetryPolicy::subnet_release();
        let started = tokio::time::Instant::now();

        let result: Result<(), (&str, u32)> =
            retry_with_backoff(&policy, "op", || async { Err("still in use") }).await;

        let (err, attempts) = result.unwrap_err();
        assert_eq!(err, "still in use");
        assert_eq!(attempts, 6);
        assert_eq!(started.elapsed(), policy.total_wait());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_does_not_sleep() {
        let started = tokio::time::Instant::now();
        let result: Result<(), (&str, u32)> =
            retry_with_backoff(&RetryPolicy::with_max_attempts(1), "op", || async { Err("no") })
                .await;
        assert_eq!(result.unwrap_err().1, 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
