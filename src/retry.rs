//! Retry policy with exponential backoff
//!
//! The policy only decides whether and when to try again. Callers observe each
//! failed attempt through a callback, which is where the fetcher logs.

use std::future::Future;
use std::time::Duration;

/// Errors that know whether another attempt could succeed
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for crate::error::FetchError {
    fn is_retryable(&self) -> bool {
        crate::error::FetchError::is_retryable(self)
    }
}

/// Default number of attempts, including the first one
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay before the first retry
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

/// Final failure of a retried operation
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay after `failed_attempt` (1-based) fails: `base * 2^(n-1)`.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error or
    /// runs out of attempts.
    ///
    /// `on_error` sees every failed attempt together with the delay before the
    /// next one (`None` when no further attempt follows).
    pub async fn run<T, E, F, Fut, N>(
        &self,
        mut operation: F,
        mut on_error: N,
    ) -> Result<T, RetryFailure<E>>
    where
        E: Retryable,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        N: FnMut(u32, &E, Option<Duration>),
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let retry = error.is_retryable() && attempt < self.max_attempts;
                    let delay = retry.then(|| self.backoff(attempt));
                    on_error(attempt, &error, delay);

                    match delay {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => {
                            return Err(RetryFailure {
                                error,
                                attempts: attempt,
                            })
                        }
                    }
                    attempt += 1;
                }
            }
        }
    }
}
