use crate::{
    client_metrics::{EVENTS_PROCESSED_TOTAL, PARTITION_PUMPS_ACTIVE, PROCESSING_ERRORS_TOTAL},
    credit_flow_processor::{CreditFlowProcessor, ReceiveStream},
    errors::ClientError,
    event_handler::{
        CloseContext, CloseReason, ErrorContext, EventContext, EventHandler,
        InitializationContext, PartitionContext,
    },
    options::ProcessorOptions,
    receive_link::{ReceiveLink, ReceiveLinkFactory},
    resource_processor::ResourceStream,
    retry_policy::retry_policy,
};

use dashmap::DashMap;
use futures::{stream, StreamExt};
use metrics::{counter, gauge};
use std::fmt;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tributary_core::{Checkpoint, EventPosition, OwnershipStore, PartitionOwnership};

/// Starts, tracks and stops the per-partition processing loops of one instance.
pub struct PartitionPumpManager {
    event_hub_name: String,
    consumer_group: String,
    link_factory: Arc<dyn ReceiveLinkFactory>,
    handler: Arc<dyn EventHandler>,
    store: Arc<dyn OwnershipStore>,
    options: Arc<ProcessorOptions>,
    pumps: Arc<DashMap<String, PartitionPump>>,
    next_pump_id: AtomicU64,
}

struct PartitionPump {
    // distinguishes a pump from its successor for the same partition
    pump_id: u64,
    stop: watch::Sender<Option<CloseReason>>,
    handle: JoinHandle<()>,
}

impl PartitionPumpManager {
    pub fn new(
        event_hub_name: impl Into<String>,
        consumer_group: impl Into<String>,
        link_factory: Arc<dyn ReceiveLinkFactory>,
        handler: Arc<dyn EventHandler>,
        store: Arc<dyn OwnershipStore>,
        options: Arc<ProcessorOptions>,
    ) -> Self {
        PartitionPumpManager {
            event_hub_name: event_hub_name.into(),
            consumer_group: consumer_group.into(),
            link_factory,
            handler,
            store,
            options,
            pumps: Arc::new(DashMap::new()),
            next_pump_id: AtomicU64::new(0),
        }
    }

    /// Starts a pump for the owned partition unless one is already running.
    ///
    /// The pump resumes right after `checkpoint` when there is one, otherwise it
    /// starts at the configured initial position of the partition.
    pub fn start_partition_pump(
        &self,
        ownership: &PartitionOwnership,
        checkpoint: Option<&Checkpoint>,
    ) {
        let partition_id = ownership.partition_id.clone();
        if let Some(existing) = self.pumps.get(&partition_id) {
            if !existing.handle.is_finished() {
                debug!(partition_id = %partition_id, "partition pump already running");
                return;
            }
        }

        let start = match checkpoint {
            Some(checkpoint) => EventPosition::after_offset(checkpoint.offset),
            None => self.options.initial_position_for(&partition_id),
        };
        let partition = PartitionContext {
            event_hub_name: self.event_hub_name.clone(),
            consumer_group: self.consumer_group.clone(),
            partition_id: partition_id.clone(),
        };

        let position = Arc::new(watch::Sender::new(start.clone()));
        let receiver = CreditFlowProcessor::new(
            format!(
                "{}/{}/{}",
                self.event_hub_name, self.consumer_group, partition_id
            ),
            link_upstream(
                Arc::clone(&self.link_factory),
                partition_id.clone(),
                Arc::clone(&position),
            ),
            self.options.prefetch_count,
            retry_policy(&self.options.retry),
        );

        let pump_id = self.next_pump_id.fetch_add(1, Ordering::SeqCst);
        let (stop, stop_rx) = watch::channel(None);
        let task = PumpTask {
            pump_id,
            partition,
            start,
            position,
            receiver,
            prefetch: self.options.prefetch_count,
            handler: Arc::clone(&self.handler),
            store: Arc::clone(&self.store),
            stop: stop_rx,
            pumps: Arc::clone(&self.pumps),
        };

        // the entry is held across the spawn so a pump failing at once deregisters after this insert
        let entry = self.pumps.entry(partition_id.clone());
        let handle = tokio::spawn(task.run());
        entry.insert(PartitionPump {
            pump_id,
            stop,
            handle,
        });

        info!(
            partition_id = %partition_id,
            pump_id,
            "partition pump started"
        );
        gauge!(PARTITION_PUMPS_ACTIVE.name).set(self.pumps.len() as f64);
    }

    /// Stops the pump of the partition and waits until its handler was closed.
    pub async fn stop_partition_pump(&self, partition_id: &str, reason: CloseReason) {
        let Some((_, pump)) = self.pumps.remove(partition_id) else {
            return;
        };
        info!(partition_id = %partition_id, reason = %reason, "stopping partition pump");
        pump.stop.send_replace(Some(reason));
        if let Err(e) = pump.handle.await {
            warn!(partition_id = %partition_id, error = %e, "partition pump task failed");
        }
        gauge!(PARTITION_PUMPS_ACTIVE.name).set(self.pumps.len() as f64);
    }

    /// Stops every running pump, used when the instance shuts down.
    pub async fn stop_all_partition_pumps(&self) {
        let partitions = self.running_partitions();
        let stops = partitions
            .iter()
            .map(|partition_id| self.stop_partition_pump(partition_id, CloseReason::Shutdown));
        futures::future::join_all(stops).await;
    }

    /// Partitions with a live pump, sorted.
    pub fn running_partitions(&self) -> Vec<String> {
        let mut partitions: Vec<String> = self
            .pumps
            .iter()
            .filter(|pump| !pump.handle.is_finished())
            .map(|pump| pump.key().clone())
            .collect();
        partitions.sort();
        partitions
    }

    pub fn is_running(&self, partition_id: &str) -> bool {
        self.pumps
            .get(partition_id)
            .is_some_and(|pump| !pump.handle.is_finished())
    }
}

impl fmt::Debug for PartitionPumpManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionPumpManager")
            .field("event_hub_name", &self.event_hub_name)
            .field("consumer_group", &self.consumer_group)
            .field("running", &self.running_partitions())
            .finish()
    }
}

// Links are created at the position following the last event the pump received,
// so a recovered link neither replays nor skips.
fn link_upstream(
    factory: Arc<dyn ReceiveLinkFactory>,
    partition_id: String,
    position: Arc<watch::Sender<EventPosition>>,
) -> ResourceStream<dyn ReceiveLink> {
    stream::unfold(
        (factory, partition_id, position),
        |(factory, partition_id, position)| async move {
            let start = position.borrow().clone();
            debug!(partition_id = %partition_id, position = %start, "creating receive link");
            let link = factory.create_link(&partition_id, start).await;
            Some((link, (factory, partition_id, position)))
        },
    )
    .boxed()
}

struct PumpTask {
    pump_id: u64,
    partition: PartitionContext,
    start: EventPosition,
    position: Arc<watch::Sender<EventPosition>>,
    receiver: CreditFlowProcessor,
    prefetch: u32,
    handler: Arc<dyn EventHandler>,
    store: Arc<dyn OwnershipStore>,
    stop: watch::Receiver<Option<CloseReason>>,
    pumps: Arc<DashMap<String, PartitionPump>>,
}

impl PumpTask {
    async fn run(mut self) {
        self.handler
            .initialize(InitializationContext {
                partition: self.partition.clone(),
                initial_position: self.start.clone(),
            })
            .await;

        let reason = match self.receiver.subscribe() {
            Ok(stream) => self.pump(stream).await,
            Err(e) => {
                self.report_error(e).await;
                CloseReason::LinkError
            }
        };

        self.receiver.close().await;
        self.handler
            .close(
                CloseContext {
                    partition: self.partition.clone(),
                },
                reason,
            )
            .await;

        let removed = self
            .pumps
            .remove_if(&self.partition.partition_id, |_, pump| {
                pump.pump_id == self.pump_id
            })
            .is_some();
        if removed {
            gauge!(PARTITION_PUMPS_ACTIVE.name).set(self.pumps.len() as f64);
        }
        info!(
            partition_id = %self.partition.partition_id,
            pump_id = self.pump_id,
            reason = %reason,
            "partition pump closed"
        );
    }

    async fn pump(&mut self, mut stream: ReceiveStream) -> CloseReason {
        // keep `prefetch` events requested; one more is requested per handled event
        stream.request(i64::from(self.prefetch));

        loop {
            let item = tokio::select! {
                changed = self.stop.changed() => {
                    let reason = *self.stop.borrow_and_update();
                    match (changed, reason) {
                        (_, Some(reason)) => return reason,
                        (Err(_), None) => return CloseReason::Shutdown,
                        (Ok(()), None) => continue,
                    }
                }
                item = stream.next() => item,
            };

            match item {
                Some(Ok(event)) => {
                    self.position
                        .send_replace(EventPosition::after_sequence_number(event.sequence_number));
                    let context =
                        EventContext::new(self.partition.clone(), &event, Arc::clone(&self.store));
                    counter!(EVENTS_PROCESSED_TOTAL.name).increment(1);
                    if let Err(e) = self.handler.process_event(context, event).await {
                        self.report_error(ClientError::Handler(e.to_string())).await;
                    }
                    stream.request(1);
                }
                Some(Err(e)) => {
                    error!(
                        partition_id = %self.partition.partition_id,
                        error = %e,
                        "receive link failed, stopping partition pump"
                    );
                    self.report_error(e).await;
                    return CloseReason::LinkError;
                }
                None => {
                    warn!(partition_id = %self.partition.partition_id, "receive stream completed");
                    return CloseReason::LinkError;
                }
            }
        }
    }

    async fn report_error(&self, error: ClientError) {
        counter!(PROCESSING_ERRORS_TOTAL.name).increment(1);
        self.handler
            .process_error(
                ErrorContext {
                    partition: self.partition.clone(),
                },
                error,
            )
            .await;
    }
}

#[cfg(test)]
#[path = "pump_manager_test.rs"]
mod tests;
