//! Exponential backoff for transient store failures.
//!
//! | Failure class | Wait before retry | Next base |
//! |---------------|-------------------|-----------|
//! | resource-exhausted | `base × 5` | `base × 2` |
//! | unavailable | `base` | `base × 2` |
//! | anything else | none (returned immediately) | n/a |
//!
//! The budget counts retries, not attempts: `max_retries = 5` allows six calls.

use std::future::Future;
use std::time::Duration;

use crate::error::{ErrorClass, StoreResult};

/// Extra multiplier applied to quota errors.
pub const QUOTA_PENALTY: u32 = 5;

/// Retry budget and first backoff step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_millis(2000),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Self {
        Self { max_retries, base_backoff }
    }

    /// Run `op` under this policy.
    pub async fn run<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        with_retry(op, self.max_retries, self.base_backoff).await
    }
}

/// Invoke `op`, retrying transient failures with exponential backoff.
///
/// Permanent errors and the error that exhausts the budget are returned as-is.
pub async fn with_retry<T, F, Fut>(
    mut op: F,
    max_retries: u32,
    base_backoff: Duration,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut remaining = max_retries;
    let mut backoff = base_backoff;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let class = err.class();
        if !class.is_transient() || remaining == 0 {
            return Err(err);
        }

        let wait = match class {
            ErrorClass::ResourceExhausted => backoff.saturating_mul(QUOTA_PENALTY),
            _ => backoff,
        };
        log::warn!(
            "Store {class}: retrying in {}ms ({remaining} retries left): {err}",
            wait.as_millis()
        );

        tokio::time::sleep(wait).await;
        backoff = backoff.saturating_mul(2);
        remaining -= 1;
    }
}
