use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::RuntimeConfig;

/// Exponential backoff between download attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts before an entry is marked failed.
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            max_retries: runtime.max_retries,
            base: Duration::from_secs(runtime.backoff_base_seconds),
            cap: Duration::from_secs(runtime.backoff_max_seconds),
        }
    }

    /// Delay after the `retry_count`-th failure: `base * 2^(retry_count - 1)`,
    /// capped.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    pub fn retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.cap.as_secs().min(i64::MAX as u64) as i64));
        now + delay
    }
}
