use crate::errors::{ClientError, Result};
use crate::retry_policy::RetryOptions;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tributary_core::EventPosition;

/// How many partitions an instance claims per load balancing pass.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// At most one unclaimed or expired partition per pass (default)
    /// Best for: large consumer groups, smooth ownership handover
    Balanced,

    /// Every unclaimed or expired partition needed to reach the target, in one pass
    /// Best for: fast start-up of a single instance
    Greedy,
}

impl Default for LoadBalancingStrategy {
    fn default() -> Self {
        Self::Balanced
    }
}

/// Event processor configuration, durations in milliseconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessorOptions {
    /// Interval between two load balancing passes
    pub load_balancing_interval_ms: u64,
    /// Ownership records not renewed within this window are considered abandoned
    pub partition_ownership_expiration_ms: u64,
    /// Claiming strategy (balanced, greedy)
    pub strategy: LoadBalancingStrategy,
    /// Credits granted to every new receive link
    pub prefetch_count: u32,
    /// Start position of partitions without checkpoint
    pub initial_position: EventPosition,
    /// Per-partition overrides of `initial_position`
    pub initial_partition_positions: HashMap<String, EventPosition>,
    /// Clear the owner id of owned partitions on stop, so peers claim them at once
    pub relinquish_on_stop: bool,
    /// Retry configuration of the receive links
    pub retry: RetryOptions,
}

impl Default for ProcessorOptions {
    fn default() -> Self {
        Self {
            load_balancing_interval_ms: 10_000,
            partition_ownership_expiration_ms: 60_000,
            strategy: LoadBalancingStrategy::Balanced,
            prefetch_count: 100,
            initial_position: EventPosition::Earliest,
            initial_partition_positions: HashMap::new(),
            relinquish_on_stop: true,
            retry: RetryOptions::default(),
        }
    }
}

impl ProcessorOptions {
    pub fn load_balancing_interval(&self) -> Duration {
        Duration::from_millis(self.load_balancing_interval_ms)
    }

    pub fn partition_ownership_expiration(&self) -> Duration {
        Duration::from_millis(self.partition_ownership_expiration_ms)
    }

    /// Start position of a partition that has no checkpoint.
    pub fn initial_position_for(&self, partition_id: &str) -> EventPosition {
        self.initial_partition_positions
            .get(partition_id)
            .cloned()
            .unwrap_or_else(|| self.initial_position.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefetch_count == 0 {
            return Err(ClientError::InvalidOptions(
                "prefetch_count must be greater than zero".to_string(),
            ));
        }
        if self.load_balancing_interval_ms == 0 {
            return Err(ClientError::InvalidOptions(
                "load_balancing_interval_ms must be greater than zero".to_string(),
            ));
        }
        // an owner must get at least one renewal in before its claim expires
        if self.partition_ownership_expiration_ms <= self.load_balancing_interval_ms {
            return Err(ClientError::InvalidOptions(format!(
                "partition_ownership_expiration_ms ({}) must be longer than load_balancing_interval_ms ({})",
                self.partition_ownership_expiration_ms, self.load_balancing_interval_ms
            )));
        }
        Ok(())
    }
}
