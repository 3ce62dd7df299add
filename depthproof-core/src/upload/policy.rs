use std::time::Duration;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::UploadError;

/// Upload retry schedule: capped exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Failed attempts before an item is permanently failed.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter as a fraction of the exponential delay, clamped to `0.0..=0.5`.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `retry_count`-th failed attempt (1-based).
    ///
    /// Jitter is derived from the capture id so a given item always gets the
    /// same schedule, and is bounded below the next doubling so delays never
    /// decrease as `retry_count` grows.
    pub fn delay_for(&self, retry_count: u32, id: &Uuid) -> Duration {
        let exponent = retry_count.saturating_sub(1);
        let delay = self
            .base_delay
            .saturating_mul(2u32.checked_pow(exponent).unwrap_or(u32::MAX));

        let ratio = self.jitter_ratio.clamp(0.0, 0.5);
        let jitter = if ratio > 0.0 && delay < self.max_delay {
            delay.mul_f64(ratio * jitter_fraction(id, retry_count))
        } else {
            Duration::ZERO
        };

        delay.saturating_add(jitter).min(self.max_delay)
    }

    /// Delay before retrying after `error`. A server `Retry-After` wins.
    pub fn next_delay(&self, error: &UploadError, retry_count: u32, id: &Uuid) -> Duration {
        error
            .retry_after()
            .unwrap_or_else(|| self.delay_for(retry_count, id))
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }
}

/// Deterministic value in `[0, 1)`.
fn jitter_fraction(id: &Uuid, retry_count: u32) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(retry_count.to_le_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}
