//! Bounded retry with linear backoff

use statsnap_common::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// How often, and how patiently, a failing item is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before retry `n` is `base_delay * n`
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay awaited before the given retry (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * retry
    }
}

/// Final result of a retried operation and how many retries it took
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub retries: u32,
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's retries are exhausted.
pub async fn run_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    retries,
                }
            }
            Err(e) if !e.is_retryable() || retries >= policy.max_retries => {
                return RetryOutcome {
                    result: Err(e),
                    retries,
                }
            }
            Err(e) => {
                retries += 1;
                let delay = policy.delay_for(retries);
                warn!(
                    item = label,
                    attempt = retries,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
