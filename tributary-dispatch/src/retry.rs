use crate::errors::DispatchError;

use rand::{rng, Rng};
use std::time::Duration;

/// Retry bounds for operations that may fail transiently, with jittered
/// backoff between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    base_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries: if max_retries == 0 { 5 } else { max_retries },
            base_backoff_ms: if base_backoff_ms == 0 {
                200
            } else {
                base_backoff_ms
            },
            max_backoff_ms: if max_backoff_ms == 0 {
                5_000
            } else {
                max_backoff_ms
            },
        }
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    /// Transient failures are worth another attempt; validation failures
    /// never are.
    pub fn is_retryable(&self, error: &DispatchError) -> bool {
        error.is_transient()
    }

    /// Backoff grows linearly with the attempt count, capped, then jittered
    /// into the 50-100% window to spread competing retriers.
    pub fn calculate_backoff(&self, attempt: usize) -> Duration {
        let linear = self.base_backoff_ms.saturating_mul(attempt as u64 + 1);
        let backoff = linear.min(self.max_backoff_ms);
        let jitter = rng().random_range(backoff / 2..=backoff);
        Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 200, 5_000)
    }
}
