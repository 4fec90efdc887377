//! Retry of field-scoped updates on transient storage errors.

use crate::error::StoreResult;
use crate::store::JobStore;
use bastion_core::{Job, JobId, JobUpdate};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Fixed-interval retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Pause between attempts
    pub interval: Duration,
}

impl RetryPolicy {
    /// Create a policy
    #[must_use]
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// Single attempt, no pause
    #[must_use]
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(5))
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out
///
/// # Errors
///
/// Returns the last error
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                tracing::warn!(attempt, error = %err, "{} failed, retrying", what);
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// [`JobStore::update_job`] under a retry policy
///
/// # Errors
///
/// Returns the last error
pub async fn update_with_retry(
    store: &dyn JobStore,
    policy: RetryPolicy,
    id: JobId,
    update: &JobUpdate,
) -> StoreResult<Job> {
    with_retry(policy, "job update", || store.update_job(id, update)).await
}
