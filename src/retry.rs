//! Error classification and the single retry policy used for remote calls.
//!
//! Transports never decide retry behaviour themselves. Each error type
//! implements [`Classify`], returning a closed [`ErrorClass`], and
//! [`RetryPolicy::run`] is the only place that sleeps and re-attempts.
//!
//! ## Backoff
//!
//! `base_delay * 2^(attempt - 1)`: with the default one second base and three
//! retries the wait sequence is 1 s → 2 s → 4 s.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// How a failed operation should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Abort immediately; retrying cannot help (bad key, exhausted quota).
    Fatal,
    /// Retry with backoff (rate limit, 5xx, timeout).
    Transient,
    /// Give up on this item without retrying, but let the caller continue.
    Skip,
}

/// Implemented by every error that can flow through [`RetryPolicy`].
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Result of [`RetryPolicy::run`] when every attempt failed or a
/// non-transient error stopped the loop.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
}

impl<E: Classify> RetryFailure<E> {
    pub fn class(&self) -> ErrorClass {
        self.error.class()
    }
}

/// Exponential backoff over transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
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

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// retry budget is spent. Server `retry-after` hints are ignored.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryFailure<E>>
    where
        E: Classify + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                let backoff = self.backoff(attempt);
                warn!(
                    "{}: retry {}/{} after {}ms",
                    label,
                    attempt,
                    self.max_retries,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let class = error.class();
                    warn!("{}: attempt {} failed ({:?}): {}", label, attempt + 1, class, error);
                    if class != ErrorClass::Transient || attempt >= self.max_retries {
                        return Err(RetryFailure {
                            error,
                            attempts: attempt + 1,
                        });
                    }
                }
            }
            attempt += 1;
        }
    }
}
