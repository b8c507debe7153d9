//! Bounded retry of a whole unit of work
//!
//! Every attempt re-runs the closure from `begin`. Only `ConcurrencyConflict`
//! and transient `StorageFailure` are retried; an attempt that exceeds the
//! unit-of-work timeout is abandoned (its transaction rolls back on drop) and
//! is not retried, since its commit outcome may be unknown.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::error::LedgerError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Hard ceiling on attempts, including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub unit_of_work_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(400),
            unit_of_work_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff)
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Run `attempt` until it succeeds, fails permanently, or attempts run out
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut attempt: F,
) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let timeout = policy.unit_of_work_timeout;
    let counter = AtomicU32::new(0);

    backoff::future::retry(policy.backoff(), || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let fut = attempt();
        async move {
            match tokio::time::timeout(timeout, fut).await {
                Err(_) => {
                    warn!(operation, attempt = n, ?timeout, "Unit of work timed out");
                    Err(backoff::Error::permanent(LedgerError::transient(format!(
                        "{} timed out after {:?}",
                        operation, timeout
                    ))))
                }
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) if e.is_retryable() && n < max_attempts => {
                    warn!(operation, attempt = n, max_attempts, error = %e, "Retrying unit of work");
                    Err(backoff::Error::transient(e))
                }
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(operation, attempts = n, error = %e, "Retries exhausted");
                    Err(backoff::Error::permanent(e.exhausted(n)))
                }
                Ok(Err(e)) => Err(backoff::Error::permanent(e)),
            }
        }
    })
    .await
}
