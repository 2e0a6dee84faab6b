use crate::{
    errors::{ClientError, Result},
    receive_link::{EmptyCreditListener, ReceiveLink},
    resource_processor::{CloseBehavior, ResourceProcessor, ResourceStream},
    retry_policy::RetryPolicy,
};

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc,
};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use tributary_core::EventData;

// outstanding demand value meaning "no backpressure"
const UNBOUNDED: i64 = i64::MAX;

/// Computes the credits granted to a link that ran out of them.
///
/// Never more than the outstanding downstream request, never more than the
/// prefetch ceiling, never less than one.
pub(crate) fn credits_to_add(requested: i64, prefetch: u32) -> u32 {
    if requested == UNBOUNDED {
        return prefetch.max(1);
    }
    if requested <= 0 {
        return 1;
    }
    requested.min(i64::from(prefetch)).max(1) as u32
}

/// Outstanding downstream request, shared by the forwarder, the credit listener
/// and the `ReceiveStream` handle.
#[derive(Debug)]
struct Demand {
    requested: AtomicI64,
    cancelled: AtomicBool,
    notify: Notify,
}

impl Demand {
    fn new() -> Self {
        Demand {
            requested: AtomicI64::new(0),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    fn requested(&self) -> i64 {
        self.requested.load(Ordering::SeqCst)
    }

    fn add(&self, n: i64) {
        let _ = self
            .requested
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != UNBOUNDED).then(|| current.saturating_add(n))
            });
        self.notify.notify_waiters();
    }

    fn set_unbounded(&self) {
        self.requested.store(UNBOUNDED, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn consume(&self) {
        let _ = self
            .requested
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current != UNBOUNDED && current > 0).then(|| current - 1)
            });
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves true once there is outstanding demand, false once cancelled.
    async fn wait_for_demand(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return false;
            }
            if self.requested() > 0 {
                return true;
            }
            notified.await;
        }
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A `ResourceProcessor` specialised for receive links with consumer driven credits.
///
/// Every link acquired is granted `prefetch` credits immediately; afterwards the
/// link asks for credits through its empty-credit listener, which never grants
/// more than the downstream requested. Events are forwarded to the single
/// downstream subscriber in arrival order, across link replacements.
#[derive(Debug)]
pub struct CreditFlowProcessor {
    processor: ResourceProcessor<dyn ReceiveLink>,
    prefetch: u32,
    demand: Arc<Demand>,
    subscribed: AtomicBool,
}

impl CreditFlowProcessor {
    pub fn new(
        name: impl Into<String>,
        upstream: ResourceStream<dyn ReceiveLink>,
        prefetch: u32,
        retry_policy: Arc<dyn RetryPolicy>,
    ) -> Self {
        CreditFlowProcessor {
            processor: ResourceProcessor::with_upstream(
                name,
                upstream,
                retry_policy,
                CloseBehavior::Complete,
            ),
            prefetch: prefetch.max(1),
            demand: Arc::new(Demand::new()),
            subscribed: AtomicBool::new(false),
        }
    }

    /// Attaches the single downstream subscriber and starts forwarding.
    ///
    /// Nothing is requested from the link until the returned stream requests events.
    ///
    /// # Errors
    /// `IllegalState` on a second subscription or on a terminated processor.
    pub fn subscribe(&self) -> Result<ReceiveStream> {
        if self.processor.is_terminated() || self.demand.is_cancelled() {
            return Err(ClientError::IllegalState(format!(
                "{} is terminated, create a new processor",
                self.processor.name()
            )));
        }
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(ClientError::IllegalState(format!(
                "{} already has a subscriber",
                self.processor.name()
            )));
        }

        let (tx, rx) = mpsc::channel(self.prefetch as usize);
        let forwarder = Forwarder {
            processor: self.processor.clone(),
            prefetch: self.prefetch,
            demand: Arc::clone(&self.demand),
            tx,
        };
        tokio::spawn(forwarder.run());

        Ok(ReceiveStream {
            events: ReceiverStream::new(rx),
            demand: Arc::clone(&self.demand),
        })
    }

    /// The link currently receiving, if any.
    pub fn current_link(&self) -> Option<Arc<dyn ReceiveLink>> {
        self.processor.current_resource()
    }

    pub fn is_terminated(&self) -> bool {
        self.processor.is_terminated()
    }

    /// Stops forwarding and closes the processor together with its current link.
    pub async fn close(&self) {
        self.demand.cancel();
        self.processor.close().await;
    }
}

struct Forwarder {
    processor: ResourceProcessor<dyn ReceiveLink>,
    prefetch: u32,
    demand: Arc<Demand>,
    tx: mpsc::Sender<Result<EventData>>,
}

impl Forwarder {
    async fn run(self) {
        let mut previous: Option<Arc<dyn ReceiveLink>> = None;

        loop {
            let next = tokio::select! {
                next = self.processor.get_resource() => next,
                _ = self.demand.cancelled() => break,
            };
            let link = match next {
                Ok(Some(link)) => link,
                Ok(None) => {
                    debug!(processor = %self.processor.name(), "receive processor completed");
                    return;
                }
                Err(error) => {
                    warn!(processor = %self.processor.name(), error = %error, "receive processor terminated with error");
                    let _ = self.tx.send(Err(error)).await;
                    return;
                }
            };

            // the link's stream already ended; wait for the processor to replace it
            if previous.as_ref().is_some_and(|p| Arc::ptr_eq(p, &link)) {
                if !self.wait_disposed(&link).await {
                    break;
                }
                continue;
            }
            previous = Some(Arc::clone(&link));

            info!(
                processor = %self.processor.name(),
                link = %link.id(),
                entity_path = %link.entity_path(),
                prefetch = self.prefetch,
                "receiving from new link"
            );
            let demand = Arc::clone(&self.demand);
            let prefetch = self.prefetch;
            let listener: EmptyCreditListener =
                Arc::new(move || credits_to_add(demand.requested(), prefetch));
            link.set_empty_credit_listener(listener);
            link.add_credits(self.prefetch);

            if !self.forward(&link).await {
                break;
            }
        }

        debug!(processor = %self.processor.name(), "downstream cancelled, closing receive processor");
        self.demand.cancel();
        self.processor.close().await;
    }

    // Returns false once the downstream is gone.
    async fn forward(&self, link: &Arc<dyn ReceiveLink>) -> bool {
        let mut events = link.receive();
        loop {
            if !self.demand.wait_for_demand().await {
                return false;
            }
            let event = tokio::select! {
                event = events.next() => event,
                _ = self.demand.cancelled() => return false,
            };
            let Some(event) = event else {
                debug!(processor = %self.processor.name(), link = %link.id(), "link stream ended");
                return true;
            };
            self.demand.consume();
            if self.tx.send(Ok(event)).await.is_err() {
                return false;
            }
        }
    }

    // Returns false once the downstream is gone.
    async fn wait_disposed(&self, link: &Arc<dyn ReceiveLink>) -> bool {
        let mut states = link.endpoint_states();
        let mut signals = link.shutdown_signals();
        loop {
            if link.is_disposed() {
                return true;
            }
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                changed = signals.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = self.demand.cancelled() => return false,
            }
        }
    }
}

/// The downstream end of a `CreditFlowProcessor`.
///
/// Events flow only against requested demand; dropping the stream cancels it.
pub struct ReceiveStream {
    events: ReceiverStream<Result<EventData>>,
    demand: Arc<Demand>,
}

impl ReceiveStream {
    /// Requests `n` more events. Non-positive requests are ignored.
    pub fn request(&self, n: i64) {
        if n <= 0 {
            warn!(requested = n, "ignoring non-positive request");
            return;
        }
        self.demand.add(n);
    }

    /// Removes backpressure: events are forwarded as fast as the link delivers them.
    pub fn request_unbounded(&self) {
        self.demand.set_unbounded();
    }

    /// Outstanding demand, `i64::MAX` when unbounded.
    pub fn requested(&self) -> i64 {
        self.demand.requested()
    }

    /// Stops crediting and releases the link.
    pub fn cancel(&self) {
        self.demand.cancel();
    }
}

impl Stream for ReceiveStream {
    type Item = Result<EventData>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

impl Drop for ReceiveStream {
    fn drop(&mut self) {
        self.demand.cancel();
    }
}

#[cfg(test)]
#[path = "credit_flow_processor_test.rs"]
mod tests;
