use crate::{
    client_metrics::describe_metrics,
    errors::{ClientError, Result},
    event_handler::EventHandler,
    load_balancer::{PartitionLoadBalancer, PartitionSource, PassSummary},
    options::ProcessorOptions,
    pump_manager::PartitionPumpManager,
    receive_link::ReceiveLinkFactory,
};

use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tributary_core::{Clock, OwnershipStore, SystemClock};

pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

/// Consumes every partition of an event hub cooperatively with the other
/// instances of the same consumer group.
///
/// Once started, the `EventProcessor` runs a load balancing pass every
/// `load_balancing_interval`, claiming its share of the partitions in the
/// ownership store and running one pump per owned partition that feeds the
/// `EventHandler`.
pub struct EventProcessor {
    balancer: Arc<PartitionLoadBalancer>,
    options: Arc<ProcessorOptions>,
    running: Mutex<Option<RunningLoop>>,
}

struct RunningLoop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl EventProcessor {
    /// Initializes a new `EventProcessorBuilder` instance.
    pub fn builder() -> EventProcessorBuilder {
        EventProcessorBuilder::default()
    }

    /// The owner id this instance writes into the ownership records.
    pub fn identifier(&self) -> &str {
        self.balancer.owner_id()
    }

    /// Starts the periodic load balancing loop. A no-op if already running.
    pub async fn start(&self) {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            info!(owner_id = %self.identifier(), "event processor already running");
            return;
        }

        describe_metrics();
        let (stop, mut stop_rx) = watch::channel(false);
        let balancer = Arc::clone(&self.balancer);
        let period = self.options.load_balancing_interval();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop_rx.changed() => break,
                }
                // a pass always runs to completion; passes never overlap
                balancer.run_once().await;
            }
        });

        info!(
            owner_id = %self.identifier(),
            interval_ms = self.options.load_balancing_interval_ms,
            strategy = ?self.options.strategy,
            "event processor started"
        );
        *running = Some(RunningLoop { stop, handle });
    }

    /// Stops the balancing loop and every partition pump.
    ///
    /// With `relinquish_on_stop`, the partitions held are released in the store so
    /// other instances claim them without waiting for the expiration.
    pub async fn stop(&self) {
        if let Some(running) = self.running.lock().await.take() {
            let _ = running.stop.send(true);
            if let Err(e) = running.handle.await {
                warn!(owner_id = %self.identifier(), error = %e, "load balancing loop failed");
            }
        }

        self.balancer.pump_manager().stop_all_partition_pumps().await;
        if self.options.relinquish_on_stop {
            self.balancer.relinquish_ownership().await;
        }
        info!(owner_id = %self.identifier(), "event processor stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Runs a single balancing pass outside the periodic loop.
    pub async fn run_once(&self) -> PassSummary {
        self.balancer.run_once().await
    }

    /// Partitions currently pumped by this instance.
    pub fn running_partitions(&self) -> Vec<String> {
        self.balancer.pump_manager().running_partitions()
    }
}

/// A builder for configuring and creating an `EventProcessor`.
///
/// The event hub name, the ownership store, the partition source, the link
/// factory and the event handler are required; the consumer group defaults to
/// `$Default`, the owner id to a random UUID and the clock to the system clock.
pub struct EventProcessorBuilder {
    event_hub_name: Option<String>,
    consumer_group: String,
    owner_id: Option<String>,
    store: Option<Arc<dyn OwnershipStore>>,
    partition_source: Option<Arc<dyn PartitionSource>>,
    link_factory: Option<Arc<dyn ReceiveLinkFactory>>,
    handler: Option<Arc<dyn EventHandler>>,
    clock: Option<Arc<dyn Clock>>,
    options: ProcessorOptions,
}

impl Default for EventProcessorBuilder {
    fn default() -> Self {
        EventProcessorBuilder {
            event_hub_name: None,
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            owner_id: None,
            store: None,
            partition_source: None,
            link_factory: None,
            handler: None,
            clock: None,
            options: ProcessorOptions::default(),
        }
    }
}

impl EventProcessorBuilder {
    pub fn with_event_hub(mut self, event_hub_name: impl Into<String>) -> Self {
        self.event_hub_name = Some(event_hub_name.into());
        self
    }

    pub fn with_consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = consumer_group.into();
        self
    }

    /// Sets the owner id written into ownership records; must be unique per instance.
    pub fn with_owner_id(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_ownership_store(mut self, store: Arc<dyn OwnershipStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_partition_source(mut self, source: Arc<dyn PartitionSource>) -> Self {
        self.partition_source = Some(source);
        self
    }

    pub fn with_link_factory(mut self, factory: Arc<dyn ReceiveLinkFactory>) -> Self {
        self.link_factory = Some(factory);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_options(mut self, options: ProcessorOptions) -> Self {
        self.options = options;
        self
    }

    /// Validates the configuration and assembles the processor.
    ///
    /// # Errors
    /// `InvalidOptions` when a required collaborator is missing or the options are inconsistent.
    pub fn build(self) -> Result<EventProcessor> {
        self.options.validate()?;

        let event_hub_name = required(self.event_hub_name, "event hub name")?;
        let store = required(self.store, "ownership store")?;
        let source = required(self.partition_source, "partition source")?;
        let link_factory = required(self.link_factory, "link factory")?;
        let handler = required(self.handler, "event handler")?;
        if self.consumer_group.is_empty() {
            return Err(ClientError::InvalidOptions(
                "consumer group must not be empty".to_string(),
            ));
        }

        let owner_id = match self.owner_id {
            Some(owner_id) if !owner_id.is_empty() => owner_id,
            Some(_) => {
                return Err(ClientError::InvalidOptions(
                    "owner id must not be empty".to_string(),
                ))
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let options = Arc::new(self.options);

        let pumps = Arc::new(PartitionPumpManager::new(
            event_hub_name.clone(),
            self.consumer_group.clone(),
            link_factory,
            handler,
            Arc::clone(&store),
            Arc::clone(&options),
        ));
        let balancer = PartitionLoadBalancer::new(
            event_hub_name,
            self.consumer_group,
            owner_id,
            store,
            source,
            pumps,
            clock,
            &options,
        );

        Ok(EventProcessor {
            balancer: Arc::new(balancer),
            options,
            running: Mutex::new(None),
        })
    }
}

fn required<T>(value: Option<T>, what: &str) -> Result<T> {
    value.ok_or_else(|| ClientError::InvalidOptions(format!("{what} is required")))
}
