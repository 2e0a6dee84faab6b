use crate::errors::ClientError;

use rand::{rng, Rng};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether, and after how long, a failed resource should be recreated.
///
/// `attempt` starts at 1 for the first failure after a successful acquisition.
pub trait RetryPolicy: Debug + Send + Sync + 'static {
    fn calculate_retry_delay(&self, error: &ClientError, attempt: u32) -> Option<Duration>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryMode {
    Fixed,
    Exponential,
}

/// Retry configuration, durations expressed in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub mode: RetryMode,
    pub max_retries: u32,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        RetryOptions {
            mode: RetryMode::Exponential,
            max_retries: 3,
            delay_ms: 800,
            max_delay_ms: 60_000,
        }
    }
}

/// Picks the policy variant named by the options.
pub fn retry_policy(options: &RetryOptions) -> Arc<dyn RetryPolicy> {
    match options.mode {
        RetryMode::Fixed => Arc::new(FixedRetryPolicy::new(options.clone())),
        RetryMode::Exponential => Arc::new(ExponentialRetryPolicy::new(options.clone())),
    }
}

/// Same base delay for every attempt, with jitter.
#[derive(Debug, Clone)]
pub struct FixedRetryPolicy {
    options: RetryOptions,
}

impl FixedRetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }
}

impl RetryPolicy for FixedRetryPolicy {
    fn calculate_retry_delay(&self, error: &ClientError, attempt: u32) -> Option<Duration> {
        if !should_retry(&self.options, error, attempt) {
            return None;
        }
        Some(with_jitter(self.options.delay_ms, self.options.max_delay_ms))
    }
}

/// Base delay doubled on every attempt, capped at `max_delay_ms`, with jitter.
#[derive(Debug, Clone)]
pub struct ExponentialRetryPolicy {
    options: RetryOptions,
}

impl ExponentialRetryPolicy {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn calculate_retry_delay(&self, error: &ClientError, attempt: u32) -> Option<Duration> {
        if !should_retry(&self.options, error, attempt) {
            return None;
        }
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.options.delay_ms.saturating_mul(factor);
        Some(with_jitter(delay, self.options.max_delay_ms))
    }
}

fn should_retry(options: &RetryOptions, error: &ClientError, attempt: u32) -> bool {
    attempt > 0 && attempt <= options.max_retries && error.is_transient()
}

// 50-100% jitter on the capped delay
fn with_jitter(delay_ms: u64, max_delay_ms: u64) -> Duration {
    let capped = delay_ms.min(max_delay_ms);
    if capped < 2 {
        return Duration::from_millis(capped);
    }
    Duration::from_millis(rng().random_range(capped / 2..=capped))
}

#[cfg(test)]
#[path = "retry_policy_test.rs"]
mod tests;
