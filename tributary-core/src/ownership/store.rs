use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use super::errors::Result;

/// One partition's current owner, as recorded in the ownership store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionOwnership {
    pub event_hub_name: String,
    pub consumer_group: String,
    pub partition_id: String,
    /// `None` and `Some("")` both mean nobody holds the partition.
    pub owner_id: Option<String>,
    /// Opaque concurrency token, assigned by the store on every successful write.
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
}

impl PartitionOwnership {
    pub fn new(
        event_hub_name: impl Into<String>,
        consumer_group: impl Into<String>,
        partition_id: impl Into<String>,
    ) -> Self {
        PartitionOwnership {
            event_hub_name: event_hub_name.into(),
            consumer_group: consumer_group.into(),
            partition_id: partition_id.into(),
            owner_id: None,
            etag: None,
            last_modified: None,
        }
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner_id.as_deref().filter(|owner| !owner.is_empty())
    }

    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner() == Some(owner_id)
    }

    /// True when the record has a non-empty owner that refreshed it within `inactivity`.
    pub fn is_active(&self, now: SystemTime, inactivity: Duration) -> bool {
        if self.owner().is_none() {
            return false;
        }
        match self.last_modified {
            Some(modified) => match now.duration_since(modified) {
                Ok(age) => age <= inactivity,
                // modified in the "future" relative to our clock: still fresh
                Err(_) => true,
            },
            None => false,
        }
    }
}

/// The last processed position of a partition for a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub event_hub_name: String,
    pub consumer_group: String,
    pub partition_id: String,
    pub offset: u64,
    pub sequence_number: i64,
}

/// External store arbitrating partition ownership between processor instances.
///
/// Claims are conditional per record: a claim is accepted only when its `etag`
/// matches the one currently stored (or when no record exists yet). The store
/// also persists checkpoints, which processors read when starting a partition.
#[async_trait]
pub trait OwnershipStore: Send + Sync + 'static {
    async fn list_ownership(
        &self,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>>;

    /// Returns only the records that were accepted, carrying their new etag and timestamp.
    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>>;

    async fn list_checkpoints(
        &self,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>>;

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()>;
}
