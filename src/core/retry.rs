//! Retry helper for idempotent store operations.
//!
//! Uses `backon` exponential backoff with jitter. Only errors that
//! [`Error::is_retryable`] accepts are retried; business rejections return at once.

use crate::errors::{Error, Result};
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Standard backoff for store retries.
///
/// - Min delay: 50ms
/// - Max delay: 5s
/// - Max attempts: 5
/// - Jitter enabled
#[must_use]
pub fn store_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

/// Runs an idempotent operation, retrying transient store failures.
pub async fn with_retry<T, F, Fut>(operation: &str, f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    f.retry(store_backoff())
        .when(Error::is_retryable)
        .notify(|err: &Error, delay: Duration| {
            warn!(operation, error = %err, ?delay, "Store operation failed, retrying");
        })
        .await
}
