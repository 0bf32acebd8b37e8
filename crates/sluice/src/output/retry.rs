//! 🔄 Bounded retry with exponential backoff, for the startup-ish operations
//! (version detection, template installs). Bulk submissions do not retry here;
//! they hand the chunk back to the host instead.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{TransportFailure, WriteError};

/// ⏳ How many times, how long between, and what happens when we run out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub fail_on_exceed: bool,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Attempt `n` (1-based) waits `base * 2^n`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor)
    }
}

/// 🔁 Run `operation` until it succeeds or `max_retries` retries are spent.
///
/// - `Ok(Some(value))`: it worked, eventually.
/// - `Ok(None)`: out of retries and not configured to care. A warning was logged.
/// - `Err(WriteError::ConnectionFailure)`: out of retries and configured to care.
pub async fn retry_operate<T, F, Fut>(
    what: &str,
    policy: RetryPolicy,
    mut operation: F,
) -> Result<Option<T>, WriteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportFailure>>,
{
    let mut retries = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(Some(value)),
            Err(failure) if retries < policy.max_retries => {
                retries += 1;
                let wait = policy.delay_for(retries);
                warn!(
                    "🔄 {what}: could not talk to the cluster ({failure}). Remaining retries: {}. Trying again in {wait:?}.",
                    policy.max_retries - retries
                );
                tokio::time::sleep(wait).await;
            }
            Err(failure) => {
                let message = format!("{what} failed after {retries} retries: {failure}");
                warn!("💀 {message}");
                if policy.fail_on_exceed {
                    return Err(WriteError::ConnectionFailure {
                        attempts: retries,
                        message,
                    });
                }
                return Ok(None);
            }
        }
    }
}
