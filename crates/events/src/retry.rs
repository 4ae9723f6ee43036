//! Backoff for transient transport failures.

use std::time::Duration;

use rand::Rng;

/// How the delay grows between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// `base * (retry + 1)`.
    Linear,
    /// `base * 2^retry`.
    #[default]
    Exponential,
}

/// Retry settings for publishing.
///
/// `max_retries` counts retries after the first attempt. Delays are capped at
/// `max_backoff`; `backoff_with_jitter` adds up to 50% on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = match self.strategy {
            BackoffStrategy::Fixed => 1,
            BackoffStrategy::Linear => retry.saturating_add(1),
            BackoffStrategy::Exponential => 1u32.checked_shl(retry.min(16)).unwrap_or(u32::MAX),
        };
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay before retry number `retry`, with jitter.
    pub fn backoff_with_jitter<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let base = self.backoff(retry);
        let jitter_ms = (base.as_millis() as u64) / 2;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rng.gen_range(0..=jitter_ms))
    }
}
