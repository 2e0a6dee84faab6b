//! In-memory receive links and partition sources.
//!
//! Used by the integration tests and by the CLI simulation in place of a broker.

use crate::endpoint::{Endpoint, EndpointState, EndpointStateTracker, ShutdownSignal};
use crate::errors::{ClientError, ErrorCondition, Result};
use crate::load_balancer::PartitionSource;
use crate::receive_link::{EmptyCreditListener, ReceiveLink, ReceiveLinkFactory};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};
use tracing::{debug, trace};
use tributary_core::{EventData, EventPosition};

/// A receive link fed from an in-process channel.
///
/// Delivery is gated by credits exactly like a broker link: each delivered event
/// consumes one credit, and when none are left the empty-credit listener is asked
/// for more before the link blocks.
pub struct InMemoryReceiveLink {
    inner: Arc<LinkInner>,
}

struct LinkInner {
    id: String,
    entity_path: String,
    partition_id: String,
    tracker: EndpointStateTracker,
    events: Mutex<Option<mpsc::UnboundedReceiver<EventData>>>,
    credits: AtomicU32,
    credit_added: Notify,
    listener: watch::Sender<Option<EmptyCreditListener>>,
    // every credit grant, in order
    grants: watch::Sender<Vec<u32>>,
}

impl InMemoryReceiveLink {
    fn new(
        id: String,
        entity_path: String,
        partition_id: String,
        events: mpsc::UnboundedReceiver<EventData>,
    ) -> Self {
        InMemoryReceiveLink {
            inner: Arc::new(LinkInner {
                id,
                entity_path,
                partition_id,
                tracker: EndpointStateTracker::new(),
                events: Mutex::new(Some(events)),
                credits: AtomicU32::new(0),
                credit_added: Notify::new(),
                listener: watch::Sender::new(None),
                grants: watch::Sender::new(Vec::new()),
            }),
        }
    }

    pub fn partition_id(&self) -> &str {
        &self.inner.partition_id
    }

    /// Credit grants received so far, initial prefetch included.
    pub fn credit_grants(&self) -> Vec<u32> {
        self.inner.grants.borrow().clone()
    }

    pub fn state(&self) -> EndpointState {
        self.inner.tracker.current()
    }

    pub fn activate(&self) {
        self.inner.tracker.set_active();
    }

    /// Fails the link as the broker would on a detach with an error.
    pub fn fail(&self, error: ClientError) {
        self.inner.tracker.set_error(error);
    }

    pub fn signal_shutdown(&self, description: &str) {
        self.inner.tracker.signal_shutdown(ShutdownSignal {
            description: description.to_string(),
            initiated_by_client: false,
        });
    }
}

impl LinkInner {
    fn grant(&self, credits: u32) {
        if credits == 0 {
            return;
        }
        self.credits.fetch_add(credits, Ordering::SeqCst);
        self.grants.send_modify(|grants| grants.push(credits));
        self.credit_added.notify_one();
    }

    async fn next_event(
        &self,
        events: &mut mpsc::UnboundedReceiver<EventData>,
        states: &mut watch::Receiver<EndpointState>,
    ) -> Option<EventData> {
        loop {
            if states.borrow_and_update().is_terminal() {
                return None;
            }

            if self.credits.load(Ordering::SeqCst) == 0 {
                let listener = self.listener.borrow().clone();
                let granted = listener.map(|listener| listener()).unwrap_or(0);
                if granted > 0 {
                    trace!(link = %self.id, granted, "credits replenished by listener");
                    self.grant(granted);
                    continue;
                }
                tokio::select! {
                    _ = self.credit_added.notified() => {}
                    _ = states.changed() => {}
                }
                continue;
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        self.credits.fetch_sub(1, Ordering::SeqCst);
                        return Some(event);
                    }
                    None => {
                        debug!(link = %self.id, "event feed dropped, closing link");
                        self.tracker.set_closed();
                        return None;
                    }
                },
                _ = states.changed() => {}
            }
        }
    }
}

#[async_trait]
impl Endpoint for InMemoryReceiveLink {
    fn id(&self) -> &str {
        &self.inner.id
    }

    fn endpoint_states(&self) -> watch::Receiver<EndpointState> {
        self.inner.tracker.states()
    }

    fn shutdown_signals(&self) -> watch::Receiver<Option<ShutdownSignal>> {
        self.inner.tracker.signals()
    }

    fn has_been_active(&self) -> bool {
        self.inner.tracker.has_been_active()
    }

    async fn close(&self) {
        if self.inner.tracker.set_closed() {
            debug!(link = %self.inner.id, "link closed");
        }
    }
}

impl ReceiveLink for InMemoryReceiveLink {
    fn entity_path(&self) -> &str {
        &self.inner.entity_path
    }

    fn receive(&self) -> BoxStream<'static, EventData> {
        let inner = Arc::clone(&self.inner);
        let states = inner.tracker.states();
        stream::unfold(
            (inner, states, None),
            |(inner, mut states, events)| async move {
                let mut events = match events {
                    Some(events) => events,
                    // a second receive() finds the feed already taken
                    None => inner.events.lock().await.take()?,
                };
                let event = inner.next_event(&mut events, &mut states).await?;
                Some((event, (inner, states, Some(events))))
            },
        )
        .boxed()
    }

    fn add_credits(&self, credits: u32) {
        self.inner.grant(credits);
    }

    fn credits(&self) -> u32 {
        self.inner.credits.load(Ordering::SeqCst)
    }

    fn set_empty_credit_listener(&self, listener: EmptyCreditListener) {
        self.inner.listener.send_replace(Some(listener));
        // a link blocked on zero credits re-consults the new listener
        self.inner.credit_added.notify_one();
    }
}

impl fmt::Debug for InMemoryReceiveLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryReceiveLink")
            .field("id", &self.inner.id)
            .field("entity_path", &self.inner.entity_path)
            .field("credits", &self.inner.credits.load(Ordering::SeqCst))
            .finish()
    }
}

#[derive(Default)]
struct PartitionFeed {
    history: Vec<EventData>,
    subscribers: Vec<(EventPosition, mpsc::UnboundedSender<EventData>)>,
}

/// Hands out `InMemoryReceiveLink`s over per-partition event feeds.
///
/// Events published to a partition are kept, so a link created at any position
/// replays the admitted history before following live events.
pub struct InMemoryLinkFactory {
    event_hub_name: String,
    feeds: DashMap<String, PartitionFeed>,
    // creation failures injected per partition, consumed in order
    failures: DashMap<String, VecDeque<ClientError>>,
    links: DashMap<String, Vec<Arc<InMemoryReceiveLink>>>,
    created: AtomicU64,
}

impl InMemoryLinkFactory {
    pub fn new(event_hub_name: impl Into<String>) -> Self {
        InMemoryLinkFactory {
            event_hub_name: event_hub_name.into(),
            feeds: DashMap::new(),
            failures: DashMap::new(),
            links: DashMap::new(),
            created: AtomicU64::new(0),
        }
    }

    /// Appends an event to the partition and pushes it to every live link admitting it.
    pub fn publish(&self, partition_id: &str, body: impl Into<Vec<u8>>) -> EventData {
        let mut feed = self.feeds.entry(partition_id.to_string()).or_default();
        let event = EventData::new(partition_id, feed.history.len() as i64, body.into());
        feed.history.push(event.clone());
        feed.subscribers.retain(|(position, subscriber)| {
            if !position.admits(event.sequence_number, event.offset) {
                return !subscriber.is_closed();
            }
            subscriber.send(event.clone()).is_ok()
        });
        event
    }

    /// The next `create_link` for the partition fails with `error`.
    pub fn fail_next_link(&self, partition_id: &str, error: ClientError) {
        self.failures
            .entry(partition_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Every link created for the partition, oldest first.
    pub fn links(&self, partition_id: &str) -> Vec<Arc<InMemoryReceiveLink>> {
        self.links
            .get(partition_id)
            .map(|links| links.clone())
            .unwrap_or_default()
    }

    pub fn latest_link(&self, partition_id: &str) -> Option<Arc<InMemoryReceiveLink>> {
        self.links
            .get(partition_id)
            .and_then(|links| links.last().cloned())
    }

    pub fn links_created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReceiveLinkFactory for InMemoryLinkFactory {
    async fn create_link(
        &self,
        partition_id: &str,
        position: EventPosition,
    ) -> Result<Arc<dyn ReceiveLink>> {
        if let Some(error) = self
            .failures
            .get_mut(partition_id)
            .and_then(|mut failures| failures.pop_front())
        {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut feed = self.feeds.entry(partition_id.to_string()).or_default();
            let start = match position {
                EventPosition::Latest => {
                    EventPosition::after_sequence_number(feed.history.len() as i64 - 1)
                }
                other => other,
            };
            for event in feed
                .history
                .iter()
                .filter(|event| start.admits(event.sequence_number, event.offset))
            {
                tx.send(event.clone()).map_err(|_| {
                    ClientError::link(ErrorCondition::InternalError, "event feed closed")
                })?;
            }
            feed.subscribers.push((start, tx));
        }

        let n = self.created.fetch_add(1, Ordering::SeqCst);
        let link = Arc::new(InMemoryReceiveLink::new(
            format!("{}-{}-link-{}", self.event_hub_name, partition_id, n),
            format!("{}/partitions/{}", self.event_hub_name, partition_id),
            partition_id.to_string(),
            rx,
        ));
        link.activate();
        self.links
            .entry(partition_id.to_string())
            .or_default()
            .push(Arc::clone(&link));

        debug!(partition_id = %partition_id, link = %link.id(), "in-memory link created");
        Ok(link)
    }
}

/// A fixed, replaceable partition list with injectable enumeration failures.
#[derive(Debug, Default)]
pub struct StaticPartitionSource {
    partitions: RwLock<Vec<String>>,
    failures: AtomicU32,
}

impl StaticPartitionSource {
    pub fn new<I, S>(partitions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StaticPartitionSource {
            partitions: RwLock::new(partitions.into_iter().map(Into::into).collect()),
            failures: AtomicU32::new(0),
        }
    }

    /// Partition ids "0".."count".
    pub fn with_count(count: usize) -> Self {
        Self::new((0..count).map(|id| id.to_string()))
    }

    pub async fn set_partitions(&self, partitions: Vec<String>) {
        *self.partitions.write().await = partitions;
    }

    /// The next `times` enumerations fail.
    pub fn fail_next(&self, times: u32) {
        self.failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl PartitionSource for StaticPartitionSource {
    async fn partition_ids(&self) -> Result<Vec<String>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ClientError::link(
                ErrorCondition::ServerBusy,
                "partition enumeration failed",
            ));
        }
        Ok(self.partitions.read().await.clone())
    }
}
