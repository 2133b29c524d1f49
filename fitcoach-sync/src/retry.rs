//! Bounded retry with backoff for remote calls.

use crate::config::RetryPolicy;
use crate::error::SyncResult;
use std::future::Future;
use tracing::{debug, warn};

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent. The last error is returned as-is.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = e.retry_after().unwrap_or_else(|| policy.delay_for(attempt));
                debug!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    label, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!("{} failed after {} attempts: {}", label, attempt, e);
                }
                return Err(e);
            }
        }
    }
}
