#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, timeout};
use tributary_client::in_memory::{InMemoryLinkFactory, StaticPartitionSource};
use tributary_client::{
    Checkpoint, ClientError, CloseContext, CloseReason, ErrorContext, EventContext, EventData,
    EventHandler, EventProcessor, LoadBalancingStrategy, ManualClock, MemoryOwnershipStore,
    OwnershipStore, PartitionOwnership, ProcessorOptions, RetryOptions, StoreError,
};

pub const HUB: &str = "telemetry";
pub const GROUP: &str = "$Default";

/// Records every callback, per partition.
#[derive(Default)]
pub struct RecordingHandler {
    pub events: Mutex<Vec<(String, i64)>>,
    pub errors: Mutex<Vec<(String, ClientError)>>,
    pub closed: Mutex<Vec<(String, CloseReason)>>,
    pub checkpoint: bool,
}

impl RecordingHandler {
    pub fn checkpointing() -> Self {
        RecordingHandler {
            checkpoint: true,
            ..Default::default()
        }
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn sequence_numbers(&self, partition_id: &str) -> Vec<i64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == partition_id)
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn closed(&self) -> Vec<(String, CloseReason)> {
        let mut closed = self.closed.lock().unwrap().clone();
        closed.sort_by(|a, b| a.0.cmp(&b.0));
        closed
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn process_event(&self, context: EventContext, event: EventData) -> anyhow::Result<()> {
        if self.checkpoint {
            context.update_checkpoint().await?;
        }
        self.events
            .lock()
            .unwrap()
            .push((context.partition().partition_id.clone(), event.sequence_number));
        Ok(())
    }

    async fn process_error(&self, context: ErrorContext, error: ClientError) {
        self.errors
            .lock()
            .unwrap()
            .push((context.partition.partition_id, error));
    }

    async fn close(&self, context: CloseContext, reason: CloseReason) {
        self.closed
            .lock()
            .unwrap()
            .push((context.partition.partition_id, reason));
    }
}

/// In-memory store whose list and claim calls can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryOwnershipStore,
    pub fail_list: AtomicBool,
    pub fail_claim: AtomicBool,
    pub claim_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn with_clock(clock: ManualClock) -> Self {
        FlakyStore {
            inner: MemoryOwnershipStore::with_clock(Arc::new(clock)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl OwnershipStore for FlakyStore {
    async fn list_ownership(
        &self,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>, StoreError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("list ownership timed out".into()));
        }
        self.inner.list_ownership(event_hub_name, consumer_group).await
    }

    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>, StoreError> {
        self.claim_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_claim.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("claim rejected by backend".into()));
        }
        self.inner.claim_ownership(requested).await
    }

    async fn list_checkpoints(
        &self,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        self.inner.list_checkpoints(event_hub_name, consumer_group).await
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        self.inner.update_checkpoint(checkpoint).await
    }
}

/// In-memory store where another owner can overwrite a record between an
/// instance's listing and its claim.
pub struct RacingStore {
    inner: MemoryOwnershipStore,
    // (partition, intruding owner), consumed by the next claim
    race: Mutex<Option<(String, String)>>,
}

impl RacingStore {
    pub fn with_clock(clock: ManualClock) -> Self {
        RacingStore {
            inner: MemoryOwnershipStore::with_clock(Arc::new(clock)),
            race: Mutex::new(None),
        }
    }

    /// Before the next claim is applied, `intruder` takes `partition_id` over.
    pub fn race_next_claim(&self, partition_id: &str, intruder: &str) {
        *self.race.lock().unwrap() = Some((partition_id.to_string(), intruder.to_string()));
    }

    async fn intrude(&self, partition_id: &str, intruder: &str) -> Result<(), StoreError> {
        let current = self
            .inner
            .list_ownership(HUB, GROUP)
            .await?
            .into_iter()
            .find(|record| record.partition_id == partition_id)
            .unwrap_or_else(|| PartitionOwnership::new(HUB, GROUP, partition_id));
        let accepted = self
            .inner
            .claim_ownership(vec![current.with_owner(intruder)])
            .await?;
        assert_eq!(accepted.len(), 1, "intruding claim must win");
        Ok(())
    }
}

#[async_trait]
impl OwnershipStore for RacingStore {
    async fn list_ownership(
        &self,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<PartitionOwnership>, StoreError> {
        self.inner.list_ownership(event_hub_name, consumer_group).await
    }

    async fn claim_ownership(
        &self,
        requested: Vec<PartitionOwnership>,
    ) -> Result<Vec<PartitionOwnership>, StoreError> {
        let race = self.race.lock().unwrap().take();
        if let Some((partition_id, intruder)) = race {
            self.intrude(&partition_id, &intruder).await?;
        }
        self.inner.claim_ownership(requested).await
    }

    async fn list_checkpoints(
        &self,
        event_hub_name: &str,
        consumer_group: &str,
    ) -> Result<Vec<Checkpoint>, StoreError> {
        self.inner.list_checkpoints(event_hub_name, consumer_group).await
    }

    async fn update_checkpoint(&self, checkpoint: Checkpoint) -> Result<(), StoreError> {
        self.inner.update_checkpoint(checkpoint).await
    }
}

pub fn start_time() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

pub fn options(strategy: LoadBalancingStrategy) -> ProcessorOptions {
    ProcessorOptions {
        strategy,
        prefetch_count: 8,
        retry: RetryOptions {
            delay_ms: 5,
            max_delay_ms: 20,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Everything the instances of one simulated consumer group share.
pub struct Cluster {
    pub clock: ManualClock,
    pub store: Arc<dyn OwnershipStore>,
    pub source: Arc<StaticPartitionSource>,
    pub links: Arc<InMemoryLinkFactory>,
    pub handler: Arc<RecordingHandler>,
}

impl Cluster {
    pub fn new(partitions: usize) -> Self {
        let clock = ManualClock::new(start_time());
        let store = Arc::new(MemoryOwnershipStore::with_clock(Arc::new(clock.clone())));
        Self::with_store(partitions, clock, store)
    }

    pub fn with_store(partitions: usize, clock: ManualClock, store: Arc<dyn OwnershipStore>) -> Self {
        Cluster {
            clock,
            store,
            source: Arc::new(StaticPartitionSource::with_count(partitions)),
            links: Arc::new(InMemoryLinkFactory::new(HUB)),
            handler: Arc::new(RecordingHandler::default()),
        }
    }

    pub fn instance(&self, owner_id: &str, options: ProcessorOptions) -> EventProcessor {
        self.instance_with_handler(owner_id, options, self.handler.clone())
    }

    pub fn instance_with_handler(
        &self,
        owner_id: &str,
        options: ProcessorOptions,
        handler: Arc<RecordingHandler>,
    ) -> EventProcessor {
        EventProcessor::builder()
            .with_event_hub(HUB)
            .with_consumer_group(GROUP)
            .with_owner_id(owner_id)
            .with_ownership_store(self.store.clone())
            .with_partition_source(self.source.clone())
            .with_link_factory(self.links.clone())
            .with_event_handler(handler)
            .with_clock(Arc::new(self.clock.clone()))
            .with_options(options)
            .build()
            .expect("valid processor configuration")
    }

    /// One balancing pass of every instance, in order, then one interval of time.
    pub async fn pass(&self, instances: &[&EventProcessor]) {
        for instance in instances {
            instance.run_once().await;
        }
        self.clock.advance(Duration::from_secs(10));
    }

    /// Active owner -> owned partitions, as the store sees it now.
    pub async fn distribution(&self) -> BTreeMap<String, Vec<String>> {
        let now = tributary_client::Clock::now(&self.clock);
        let mut owners: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in self.store.list_ownership(HUB, GROUP).await.unwrap() {
            if !record.is_active(now, Duration::from_secs(60)) {
                continue;
            }
            if let Some(owner) = record.owner() {
                owners
                    .entry(owner.to_string())
                    .or_default()
                    .push(record.partition_id.clone());
            }
        }
        owners
    }

    /// Sorted partition counts of the active owners.
    pub async fn loads(&self) -> Vec<usize> {
        let mut loads: Vec<usize> = self.distribution().await.values().map(Vec::len).collect();
        loads.sort_unstable();
        loads
    }
}

pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
