use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{
    errors::{Result, StoreError},
    store::{Checkpoint, OwnershipStore, PartitionOwnership},
};
use crate::clock::{Clock, SystemClock};

// (event hub, consumer group, partition id)
type RecordKey = (String, String, String);

/// MemoryOwnershipStore is an in-memory ownership and checkpoint store.
/// SHOULD BE USED ONLY FOR TESTING AND SIMULATION PURPOSES
#[derive(Debug, Clone)]
pub struct MemoryOwnershipStore {
    ownership: Arc<DashMap<RecordKey, PartitionOwnership>>,
    checkpoints: Arc<DashMap<RecordKey, Checkpoint>>,
    clock: Arc<dyn Clock>,
}

impl MemoryOwnershipStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// The clock stamps `last_modified` on every accepted claim.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        MemoryOwnershipStore {
            ownership: Arc::new(DashMap::new()),
            checkpoints: Arc::new(DashMap::new()),
            clock,
        }
    }

    fn key(event_hub_name: &str, consumer_group: &str, partition_id: &str) -> RecordKey {
        (
            event_hub_name.to_string(),
            consumer_group.to_string(),
            partition_id.to_string(),
        )
    }
}

impl Default for MemoryOwnershipStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OwnershipStore for MemoryOwnershipStore {
    async fn list_ownership(
        &self,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>> {
        let mut records: Vec<PartitionOwnership> = self
            .ownership
            .iter()
            .filter(|entry| entry.key().0 == event_hub_name && entry.key().1 == consumer_group)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(records)
    }

    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>> {
        // a malformed batch is rejected before any record is written
        if requested.iter().any(|request| request.partition_id.is_empty()) {
            return Err(StoreError::InvalidArguments(
                "ownership claim without a partition id".to_string(),
            ));
        }

        let mut accepted = Vec::with_capacity(requested.len());

        for request in requested {
            let key = Self::key(
                &request.event_hub_name,
                &request.consumer_group,
                &request.partition_id,
            );

            // the entry guard holds the shard lock, making check-and-set atomic per record
            match self.ownership.entry(key) {
                Entry::Occupied(mut occupied) => {
                    if occupied.get().etag != request.etag {
                        debug!(
                            partition_id = %request.partition_id,
                            requested_owner = ?request.owner_id,
                            "etag mismatch, ownership claim rejected"
                        );
                        continue;
                    }
                    let mut record = request;
                    record.etag = Some(Uuid::new_v4().to_string());
                    record.last_modified = Some(self.clock.now());
                    occupied.insert(record.clone());
                    accepted.push(record);
                }
                Entry::Vacant(vacant) => {
                    let mut record = request;
                    record.etag = Some(Uuid::new_v4().to_string());
                    record.last_modified = Some(self.clock.now());
                    vacant.insert(record.clone());
                    accepted.push(record);
                }
            }
        }

        Ok(accepted)
    }

    async fn list_checkpoints(
        &self,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>> {
        let mut checkpoints: Vec<Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|entry| entry.key().0 == event_hub_name && entry.key().1 == consumer_group)
            .map(|entry| entry.value().clone())
            .collect();
        checkpoints.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(checkpoints)
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<()> {
        if checkpoint.partition_id.is_empty() {
            return Err(StoreError::InvalidArguments(
                "checkpoint without a partition id".to_string(),
            ));
        }
        let key = Self::key(
            &checkpoint.event_hub_name,
            &checkpoint.consumer_group,
            &checkpoint.partition_id,
        );
        self.checkpoints.insert(key, checkpoint);
        Ok(())
    }
}

#[cfg(test)]
#[path = "memory_store_test.rs"]
mod tests;
