//! Retry with exponential backoff for broker setup calls
//!
//! The bus never retries publishes on its own. This helper is for callers
//! that own a retry decision, such as a process connecting to Redis at
//! startup.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// Every error is treated as retryable. See [`retry_if`] to stop early on
/// permanent failures.
///
/// # Example
/// ```rust
/// use event_bus::retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let value = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &config,
///     "connect_broker",
/// )
/// .await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_if(operation, config, context, |_| true).await
}

/// Retry while `should_retry` classifies the error as transient
///
/// Returns the first success, the first permanent error, or the last error
/// once `max_attempts` is reached.
pub async fn retry_if<F, Fut, T, E, P>(
    operation: F,
    config: &RetryConfig,
    context: &str,
    should_retry: P,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        attempt += 1;

        let err = match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context = %context, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if !should_retry(&err) {
            warn!(context = %context, attempt, error = %err, "Operation failed with permanent error");
            return Err(err);
        }

        if attempt >= config.max_attempts.max(1) {
            warn!(context = %context, attempts = attempt, error = %err, "Operation failed after max retries");
            return Err(err);
        }

        warn!(
            context = %context,
            attempt,
            max_attempts = config.max_attempts,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Operation failed, retrying with backoff"
        );

        sleep(backoff).await;
        backoff = std::cmp::min(backoff * 2, config.max_backoff);
    }
}
