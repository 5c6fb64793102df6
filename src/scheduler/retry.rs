//! Retry policy: what happens to a task after a failed attempt.
//!
//! The delay before retry `n` (1-based) is `base × 2^(n-1)` plus a random
//! jitter of up to `jitter × base × 2^(n-1)`, capped at `max_delay`. The
//! jittered value never feeds into later attempts.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::TaskError;

/// Bounded exponential backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Transient failures tolerated before a task fails for good
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter upper bound as a fraction of the un-jittered delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

/// Jitter never exceeds a tenth of the un-jittered delay.
pub const MAX_JITTER: f64 = 0.1;

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: if config.jitter.is_nan() {
                MAX_JITTER
            } else {
                config.jitter.clamp(0.0, MAX_JITTER)
            },
        }
    }
}

/// Where a failed task goes next.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Service out of capacity: back to the head of its bucket, count unchanged.
    Reclaim { reset_time: Option<i64> },
    /// Park for `delay`, then re-enter the tail of its bucket.
    Retry { retry_count: u32, delay: Duration },
    /// Terminal failure.
    Fail { retry_count: u32, reason: String },
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `retry_count` (1-based), capped.
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31) as i32;
        let unclamped = self.base_delay.as_secs_f64() * 2f64.powi(exponent);
        if !unclamped.is_finite() || unclamped >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(unclamped)
        }
    }

    /// Jittered delay before retry number `retry_count`, never above `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base = self.base_delay_for(retry_count);
        let bound = base.as_secs_f64() * self.jitter;
        let extra = if bound > 0.0 {
            rand::rng().random_range(0.0..=bound)
        } else {
            0.0
        };
        (base + Duration::from_secs_f64(extra)).min(self.max_delay)
    }

    /// Classify a failure given the task's retry count before the attempt.
    pub fn decide(&self, retry_count: u32, error: &TaskError) -> RetryDecision {
        match error {
            TaskError::RateLimited { reset_time, .. } => RetryDecision::Reclaim {
                reset_time: *reset_time,
            },
            TaskError::Transient(_) => {
                let retry_count = retry_count + 1;
                if retry_count <= self.max_retries {
                    RetryDecision::Retry {
                        retry_count,
                        delay: self.delay_for(retry_count),
                    }
                } else {
                    RetryDecision::Fail {
                        retry_count,
                        reason: format!("{} (gave up after {} retries)", error, self.max_retries),
                    }
                }
            }
            TaskError::Fatal(_) | TaskError::Cancelled | TaskError::Shutdown => RetryDecision::Fail {
                retry_count,
                reason: error.to_string(),
            },
        }
    }
}
