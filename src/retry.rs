//! Bounded exponential backoff for upstream weather fetches
//!
//! Only [`ProviderError::Transient`] failures are retried. Not-found, invalid
//! input and malformed responses return after the first attempt.

use std::future::Future;
use std::time::Duration;

use crate::data::ProviderError;

/// Default total number of attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 8000;

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failure (doubles each attempt)
    pub base_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    /// Delay to wait after failed attempt number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }
}

/// Run `operation` until it succeeds, fails permanently, or runs out of attempts.
///
/// # Arguments
/// * `policy` - Attempt count and backoff delays
/// * `operation` - Async closure performing one provider call
///
/// # Returns
/// The first success, the first non-transient error, or the last transient
/// error once every attempt is used. A policy with zero attempts still makes one.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!("Fetch succeeded after {} retries", attempt);
                }
                return Ok(value);
            }
            Err(e) if !e.is_transient() => {
                tracing::debug!("Non-retryable error: {}", e);
                return Err(e);
            }
            Err(e) if attempt + 1 >= attempts => {
                tracing::error!("All {} attempts exhausted: {}", attempts, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    "Transient error on attempt {} of {}, retrying in {:?}: {}",
                    attempt + 1,
                    attempts,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
