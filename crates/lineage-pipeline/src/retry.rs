//! In-process retry of step compute with configurable backoff.

use std::time::Duration;

use lineage_types::{LineageError, Result};

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base: Duration, max: Duration },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(attempt.min(31) as u32);
                base.saturating_mul(factor).min(*max)
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(200),
            max: Duration::from_secs(10),
        }
    }
}

/// Run `f` up to `max_retries + 1` times, retrying only errors for which
/// [`LineageError::is_retryable`] holds. A retryable error that outlives every
/// attempt becomes [`LineageError::RetriesExhausted`]; non-retryable errors,
/// and any error when `max_retries` is zero, are returned as-is.
pub async fn execute_with_retry<T, F, Fut>(
    f: F,
    max_retries: usize,
    policy: &BackoffPolicy,
    step_key: &str,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(step = %step_key, attempt, delay_ms = %delay.as_millis(), error = %e, "Retryable step error, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) if e.is_retryable() && max_retries > 0 => {
                tracing::warn!(step = %step_key, attempts = attempt + 1, "Step retries exhausted");
                return Err(LineageError::RetriesExhausted {
                    step_key: step_key.to_string(),
                    attempts: attempt + 1,
                });
            }
            Err(e) => return Err(e),
        }
    }
}
