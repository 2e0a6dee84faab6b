use crate::errors::{ClientError, Result};

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tributary_core::{Checkpoint, EventData, EventPosition, OwnershipStore};

/// Identifies the partition a handler callback is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PartitionContext {
    pub event_hub_name: String,
    pub consumer_group: String,
    pub partition_id: String,
}

/// Passed to `EventHandler::initialize` before the first event of a partition.
#[derive(Debug, Clone)]
pub struct InitializationContext {
    pub partition: PartitionContext,
    // where the first link of the pump starts reading
    pub initial_position: EventPosition,
}

/// Passed along with every event; lets the handler checkpoint it.
#[derive(Clone)]
pub struct EventContext {
    partition: PartitionContext,
    sequence_number: i64,
    offset: u64,
    store: Arc<dyn OwnershipStore>,
}

impl EventContext {
    pub(crate) fn new(
        partition: PartitionContext,
        event: &EventData,
        store: Arc<dyn OwnershipStore>,
    ) -> Self {
        EventContext {
            partition,
            sequence_number: event.sequence_number,
            offset: event.offset,
            store,
        }
    }

    pub fn partition(&self) -> &PartitionContext {
        &self.partition
    }

    /// Records this event as the last one processed for the partition.
    /// A pump started later for the partition resumes right after it.
    pub async fn update_checkpoint(&self) -> Result<()> {
        let checkpoint = Checkpoint {
            event_hub_name: self.partition.event_hub_name.clone(),
            consumer_group: self.partition.consumer_group.clone(),
            partition_id: self.partition.partition_id.clone(),
            offset: self.offset,
            sequence_number: self.sequence_number,
        };
        self.store.update_checkpoint(checkpoint).await?;
        Ok(())
    }
}

impl fmt::Debug for EventContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventContext")
            .field("partition", &self.partition)
            .field("sequence_number", &self.sequence_number)
            .field("offset", &self.offset)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub partition: PartitionContext,
}

#[derive(Debug, Clone)]
pub struct CloseContext {
    pub partition: PartitionContext,
}

/// Why a partition pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Another instance claimed the partition.
    LostOwnership,
    /// The processor is shutting down.
    Shutdown,
    /// The receive link failed and could not be recovered.
    LinkError,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LostOwnership => write!(f, "lost_ownership"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::LinkError => write!(f, "link_error"),
        }
    }
}

/// User callbacks driven by the partition pumps.
///
/// One pump calls its handler sequentially; pumps of different partitions call
/// concurrently, so implementations must be shareable.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn initialize(&self, _context: InitializationContext) {}

    /// A failure is reported to `process_error`; the pump keeps running.
    async fn process_event(&self, context: EventContext, event: EventData) -> anyhow::Result<()>;

    async fn process_error(&self, context: ErrorContext, error: ClientError);

    async fn close(&self, _context: CloseContext, _reason: CloseReason) {}
}
