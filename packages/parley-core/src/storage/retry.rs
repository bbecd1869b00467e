//! Bounded retry with fixed back-off.
//!
//! Transient store failures (file contention, a temp file not yet renamed)
//! are retried here before they reach the caller. The wait is an async
//! sleep, so other tasks keep running while one operation backs off.

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default number of attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Default delay between attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// How often and how patiently an operation is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy that tries exactly once
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Only errors for which [`Error::is_transient`] holds are retried; any
/// other error is returned immediately.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Transient store failure"
                );
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    tracing::error!(operation, attempts, "Giving up on store operation");
    Err(Error::RetriesExhausted {
        operation: operation.to_string(),
        attempts,
        last_error,
    })
}
