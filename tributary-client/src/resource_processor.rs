use crate::{
    client_metrics::{RESOURCE_REQUESTS_TOTAL, RESOURCE_RETRIES_TOTAL},
    endpoint::{Endpoint, EndpointState},
    errors::{ClientError, Result},
    retry_policy::RetryPolicy,
};

use futures::{stream::BoxStream, StreamExt};
use metrics::counter;
use std::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Upstream sequence of freshly created resources. Polling it once creates one resource.
pub type ResourceStream<T> = BoxStream<'static, Result<Arc<T>>>;

/// What subscribers observe once the processor has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseBehavior {
    /// The subscription completes without a resource (receive links).
    Complete,
    /// The subscription fails with `ClientError::AlreadyClosed` (connections).
    Error,
}

// The single slot holding the processor's current resource.
enum Slot<T: ?Sized> {
    Empty,
    Requesting,
    Backoff,
    Active(Arc<T>),
    Completed,
    Failed(ClientError),
}

impl<T: ?Sized> Slot<T> {
    fn is_terminal(&self) -> bool {
        matches!(self, Slot::Completed | Slot::Failed(_))
    }

    fn label(&self) -> &'static str {
        match self {
            Slot::Empty => "empty",
            Slot::Requesting => "requesting",
            Slot::Backoff => "backoff",
            Slot::Active(_) => "active",
            Slot::Completed => "completed",
            Slot::Failed(_) => "failed",
        }
    }
}

/// ResourceProcessor owns at most one live instance of an expensive resource
/// (connection, link) and hands that same instance to every subscriber.
///
/// Resources are pulled from the upstream only on demand: the first subscriber
/// arriving while no resource is live triggers exactly one upstream request,
/// concurrent subscribers wait for that request. A resource that closes
/// gracefully, or signals shutdown, is discarded and replaced on the next
/// subscription. A resource that fails is replaced after the delay chosen by the
/// `RetryPolicy`; when the policy gives up, the error becomes terminal and is
/// replayed to every subscriber from then on.
pub struct ResourceProcessor<T: Endpoint + ?Sized> {
    shared: Arc<Shared<T>>,
}

struct Shared<T: Endpoint + ?Sized> {
    name: String,
    slot: watch::Sender<Slot<T>>,
    upstream: Mutex<Option<ResourceStream<T>>>,
    // set once an upstream was attached, never reset
    attached: AtomicBool,
    retry_policy: Arc<dyn RetryPolicy>,
    // consecutive failures since the last resource that became active
    retry_attempts: AtomicU32,
    close_behavior: CloseBehavior,
    upstream_requests: AtomicU64,
}

impl<T: Endpoint + ?Sized> ResourceProcessor<T> {
    /// Creates a processor without an upstream; subscribers wait until one is attached.
    pub fn new(
        name: impl Into<String>,
        retry_policy: Arc<dyn RetryPolicy>,
        close_behavior: CloseBehavior,
    ) -> Self {
        Self::build(name.into(), None, retry_policy, close_behavior)
    }

    pub fn with_upstream(
        name: impl Into<String>,
        upstream: ResourceStream<T>,
        retry_policy: Arc<dyn RetryPolicy>,
        close_behavior: CloseBehavior,
    ) -> Self {
        Self::build(name.into(), Some(upstream), retry_policy, close_behavior)
    }

    fn build(
        name: String,
        upstream: Option<ResourceStream<T>>,
        retry_policy: Arc<dyn RetryPolicy>,
        close_behavior: CloseBehavior,
    ) -> Self {
        ResourceProcessor {
            shared: Arc::new(Shared {
                name,
                slot: watch::Sender::new(Slot::Empty),
                attached: AtomicBool::new(upstream.is_some()),
                upstream: Mutex::new(upstream),
                retry_policy,
                retry_attempts: AtomicU32::new(0),
                close_behavior,
                upstream_requests: AtomicU64::new(0),
            }),
        }
    }

    /// Attaches the upstream resource sequence. Nothing is requested until a subscriber arrives.
    ///
    /// # Errors
    /// `IllegalState` if an upstream is already attached or the processor is terminated.
    pub async fn subscribe_upstream(&self, upstream: ResourceStream<T>) -> Result<()> {
        let mut guard = self.shared.upstream.lock().await;
        if self.shared.slot.borrow().is_terminal() {
            return Err(ClientError::IllegalState(format!(
                "{} is terminated, create a new processor",
                self.shared.name
            )));
        }
        if guard.is_some() || self.shared.attached.load(Ordering::SeqCst) {
            return Err(ClientError::IllegalState(format!(
                "{} is already subscribed to an upstream",
                self.shared.name
            )));
        }
        *guard = Some(upstream);
        self.shared.attached.store(true, Ordering::SeqCst);
        drop(guard);

        // wake subscribers that arrived before the upstream
        self.shared.slot.send_modify(|_| {});
        Ok(())
    }

    /// Returns the current live resource, requesting one from upstream if none is live.
    ///
    /// # Returns
    /// - `Ok(Some(resource))` - the one live resource, shared with every other subscriber.
    /// - `Ok(None)` - the processor was closed (`CloseBehavior::Complete`) or upstream ended.
    /// - `Err(e)` - the terminal error, or `AlreadyClosed` for `CloseBehavior::Error`.
    pub async fn get_resource(&self) -> Result<Option<Arc<T>>> {
        let mut slot_rx = self.shared.slot.subscribe();
        loop {
            let request = {
                let slot = slot_rx.borrow_and_update();
                match &*slot {
                    Slot::Active(resource) if !resource.is_disposed() => {
                        return Ok(Some(Arc::clone(resource)));
                    }
                    // a disposed resource is replaced once its monitor observes the transition
                    Slot::Active(_) | Slot::Requesting | Slot::Backoff => false,
                    Slot::Empty => true,
                    Slot::Completed => return self.shared.closed_result(),
                    Slot::Failed(error) => return Err(error.clone()),
                }
            };

            if request {
                self.shared.try_request();
            }

            if slot_rx.changed().await.is_err() {
                return Err(ClientError::AlreadyClosed(self.shared.name.clone()));
            }
        }
    }

    /// The live resource if there is one, without triggering an upstream request.
    pub fn current_resource(&self) -> Option<Arc<T>> {
        match &*self.shared.slot.borrow() {
            Slot::Active(resource) => Some(Arc::clone(resource)),
            _ => None,
        }
    }

    /// Moves the processor to terminal-completed and closes the live resource.
    /// No resource is requested from upstream afterwards.
    pub async fn close(&self) {
        let previous = match self.shared.terminate(Slot::Completed) {
            Some(previous) => previous,
            None => return,
        };
        info!(processor = %self.shared.name, "closing resource processor");

        if let Slot::Active(resource) = previous {
            resource.close().await;
        }
        self.shared.upstream.lock().await.take();
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.slot.borrow().is_terminal()
    }

    /// Number of resources requested from upstream so far.
    pub fn upstream_requests(&self) -> u64 {
        self.shared.upstream_requests.load(Ordering::SeqCst)
    }

    pub fn retry_attempts(&self) -> u32 {
        self.shared.retry_attempts.load(Ordering::SeqCst)
    }
}

impl<T: Endpoint + ?Sized> Shared<T> {
    fn closed_result(&self) -> Result<Option<Arc<T>>> {
        match self.close_behavior {
            CloseBehavior::Complete => Ok(None),
            CloseBehavior::Error => Err(ClientError::AlreadyClosed(self.name.clone())),
        }
    }

    fn try_request(self: &Arc<Self>) {
        if !self.attached.load(Ordering::SeqCst) {
            return;
        }
        let started = self.slot.send_if_modified(|slot| {
            if matches!(slot, Slot::Empty) {
                *slot = Slot::Requesting;
                true
            } else {
                false
            }
        });
        if started {
            let shared = Arc::clone(self);
            tokio::spawn(async move { shared.request_upstream().await });
        }
    }

    async fn request_upstream(self: Arc<Self>) {
        let mut slot_rx = self.slot.subscribe();
        let next = {
            let mut upstream = self.upstream.lock().await;
            let Some(stream) = upstream.as_mut() else {
                return;
            };

            self.upstream_requests.fetch_add(1, Ordering::SeqCst);
            counter!(RESOURCE_REQUESTS_TOTAL.name).increment(1);
            debug!(processor = %self.name, "requesting a new resource from upstream");

            tokio::select! {
                next = stream.next() => next,
                _ = wait_terminal(&mut slot_rx) => return,
            }
        };

        match next {
            Some(Ok(resource)) => self.on_next(resource),
            Some(Err(error)) => self.on_error(None, error),
            None => {
                info!(processor = %self.name, "upstream completed, no more resources will be created");
                let previous = self.terminate(Slot::Completed);
                self.release(previous);
            }
        }
    }

    fn on_next(self: &Arc<Self>, resource: Arc<T>) {
        let accepted = self.slot.send_if_modified(|slot| {
            if matches!(slot, Slot::Requesting) {
                *slot = Slot::Active(Arc::clone(&resource));
                true
            } else {
                false
            }
        });

        if !accepted {
            // terminated while the resource was being created
            tokio::spawn(async move { resource.close().await });
            return;
        }

        info!(processor = %self.name, resource = %resource.id(), "acquired new resource");
        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.monitor(resource).await });
    }

    // Follows one resource until it is closed, fails, signals shutdown or is superseded.
    async fn monitor(self: Arc<Self>, resource: Arc<T>) {
        let mut states = resource.endpoint_states();
        let mut signals = resource.shutdown_signals();
        let mut slot_rx = self.slot.subscribe();
        let mut signals_open = true;

        loop {
            let state = states.borrow_and_update().clone();
            match state {
                EndpointState::Uninitialized => {}
                EndpointState::Active => {
                    if self.retry_attempts.swap(0, Ordering::SeqCst) > 0 {
                        debug!(processor = %self.name, resource = %resource.id(), "resource active, retry attempts reset");
                    }
                }
                EndpointState::Closed => {
                    self.discard(&resource, "endpoint closed");
                    return;
                }
                EndpointState::Errored(error) => {
                    // `Active` may have been overwritten before this task observed it
                    if resource.has_been_active() {
                        self.retry_attempts.store(0, Ordering::SeqCst);
                    }
                    self.on_error(Some(&resource), error);
                    return;
                }
            }

            let signal = signals.borrow_and_update().clone();
            if let Some(signal) = signal {
                info!(
                    processor = %self.name,
                    resource = %resource.id(),
                    description = %signal.description,
                    initiated_by_client = signal.initiated_by_client,
                    "shutdown signal received"
                );
                self.discard(&resource, "shutdown signalled");
                resource.close().await;
                return;
            }

            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        self.discard(&resource, "endpoint state channel dropped");
                        return;
                    }
                }
                changed = signals.changed(), if signals_open => {
                    if changed.is_err() {
                        signals_open = false;
                    }
                }
                _ = wait_superseded(&mut slot_rx, &resource) => return,
            }
        }
    }

    fn discard(&self, resource: &Arc<T>, reason: &str) {
        let discarded = self.slot.send_if_modified(|slot| match slot {
            Slot::Active(current) if Arc::ptr_eq(current, resource) => {
                *slot = Slot::Empty;
                true
            }
            _ => false,
        });
        if discarded {
            info!(processor = %self.name, resource = %resource.id(), reason, "resource discarded");
        }
    }

    // `resource` is None when the upstream itself failed to create a resource.
    fn on_error(self: &Arc<Self>, resource: Option<&Arc<T>>, error: ClientError) {
        let is_current = |slot: &Slot<T>| match (slot, resource) {
            (Slot::Active(current), Some(resource)) => Arc::ptr_eq(current, resource),
            (Slot::Requesting, None) => true,
            _ => false,
        };
        if !is_current(&*self.slot.borrow()) {
            return;
        }

        let attempt = self.retry_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.retry_policy.calculate_retry_delay(&error, attempt) {
            Some(delay) => {
                let scheduled = self.slot.send_if_modified(|slot| {
                    if is_current(&*slot) {
                        *slot = Slot::Backoff;
                        true
                    } else {
                        false
                    }
                });
                if !scheduled {
                    return;
                }

                counter!(RESOURCE_RETRIES_TOTAL.name).increment(1);
                warn!(
                    processor = %self.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient resource error, retrying after backoff"
                );

                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    shared.slot.send_if_modified(|slot| {
                        if matches!(slot, Slot::Backoff) {
                            *slot = Slot::Empty;
                            true
                        } else {
                            false
                        }
                    });
                });
            }
            None => {
                error!(
                    processor = %self.name,
                    attempt,
                    error = %error,
                    "non-retryable resource error, processor terminated"
                );
                let previous = self.terminate(Slot::Failed(error));
                self.release(previous);
            }
        }
    }

    /// Swaps in a terminal slot. Returns the previous slot, or None if already terminal.
    fn terminate(&self, terminal: Slot<T>) -> Option<Slot<T>> {
        let mut previous = None;
        self.slot.send_if_modified(|slot| {
            if slot.is_terminal() {
                return false;
            }
            previous = Some(std::mem::replace(slot, terminal));
            true
        });
        previous
    }

    // Closes whatever was live in `previous` and drops the upstream.
    fn release(self: &Arc<Self>, previous: Option<Slot<T>>) {
        let Some(previous) = previous else {
            return;
        };
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Slot::Active(resource) = previous {
                resource.close().await;
            }
            shared.upstream.lock().await.take();
        });
    }
}

async fn wait_terminal<T: ?Sized>(slot_rx: &mut watch::Receiver<Slot<T>>) {
    loop {
        if slot_rx.borrow_and_update().is_terminal() {
            return;
        }
        if slot_rx.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_superseded<T: ?Sized>(slot_rx: &mut watch::Receiver<Slot<T>>, resource: &Arc<T>) {
    loop {
        let superseded = match &*slot_rx.borrow_and_update() {
            Slot::Active(current) => !Arc::ptr_eq(current, resource),
            _ => true,
        };
        if superseded {
            return;
        }
        if slot_rx.changed().await.is_err() {
            return;
        }
    }
}

impl<T: Endpoint + ?Sized> Clone for ResourceProcessor<T> {
    fn clone(&self) -> Self {
        ResourceProcessor {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Endpoint + ?Sized> fmt::Debug for ResourceProcessor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceProcessor")
            .field("name", &self.shared.name)
            .field("state", &self.shared.slot.borrow().label())
            .field("close_behavior", &self.shared.close_behavior)
            .finish()
    }
}

#[cfg(test)]
#[path = "resource_processor_test.rs"]
mod tests;
