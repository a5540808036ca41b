//! Bounded retry for whole-batch metadata loads.
//!
//! Only errors classified as transient are retried. Individual probes never
//! go through here: a slow probe degrades to its fallback instead.

use crate::config::RetryPolicy;
use crate::error::DriftProbeError;
use crate::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff for retry `attempt` plus up to 50% random jitter.
pub fn backoff_with_jitter(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.backoff(attempt);
    let spread = u64::try_from(base.as_millis() / 2).unwrap_or(0);
    let jitter_ms = if spread == 0 {
        0
    } else {
        rand::rng().random_range(0..=spread)
    };
    base + Duration::from_millis(jitter_ms)
}

/// Runs `operation`, retrying transient failures per `policy`.
///
/// # Arguments
/// * `policy` - Retry count and backoff
/// * `cancel` - Aborts the wait between attempts
/// * `operation_name` - Used in log messages
/// * `operation` - Produces a fresh attempt future on every call
///
/// # Errors
/// Returns the last error once retries are exhausted, the first
/// non-transient error immediately, or a cancellation error if `cancel`
/// fires while waiting.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(
                        operation = operation_name,
                        attempts = attempt + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = backoff_with_jitter(policy, attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        return Err(DriftProbeError::cancelled(format!(
                            "{} cancelled while waiting to retry",
                            operation_name
                        )));
                    }
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
