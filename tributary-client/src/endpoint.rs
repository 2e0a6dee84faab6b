use crate::errors::ClientError;

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Lifecycle of a connection or link. `Closed` and `Errored` are terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum EndpointState {
    Uninitialized,
    Active,
    Closed,
    Errored(ClientError),
}

impl EndpointState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EndpointState::Closed | EndpointState::Errored(_))
    }
}

/// Emitted when the remote side (or the client) shuts the endpoint down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownSignal {
    pub description: String,
    pub initiated_by_client: bool,
}

/// A live networked resource managed by a `ResourceProcessor`.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    fn id(&self) -> &str;

    /// Latest endpoint state; every transition is published on the channel.
    fn endpoint_states(&self) -> watch::Receiver<EndpointState>;

    /// `Some` once a shutdown was signalled.
    fn shutdown_signals(&self) -> watch::Receiver<Option<ShutdownSignal>>;

    async fn close(&self);

    /// True once the endpoint reached `Active`, even if it has since failed or closed.
    fn has_been_active(&self) -> bool;

    /// A disposed endpoint will never serve requests again.
    fn is_disposed(&self) -> bool {
        self.endpoint_states().borrow().is_terminal() || self.shutdown_signals().borrow().is_some()
    }
}

/// Producer half of the endpoint notification channels, embedded by endpoint implementations.
#[derive(Debug)]
pub struct EndpointStateTracker {
    states: watch::Sender<EndpointState>,
    signals: watch::Sender<Option<ShutdownSignal>>,
    // set before `Active` is published, never cleared
    activated: AtomicBool,
}

impl EndpointStateTracker {
    pub fn new() -> Self {
        EndpointStateTracker {
            states: watch::Sender::new(EndpointState::Uninitialized),
            signals: watch::Sender::new(None),
            activated: AtomicBool::new(false),
        }
    }

    pub fn has_been_active(&self) -> bool {
        self.activated.load(Ordering::SeqCst)
    }

    pub fn states(&self) -> watch::Receiver<EndpointState> {
        self.states.subscribe()
    }

    pub fn signals(&self) -> watch::Receiver<Option<ShutdownSignal>> {
        self.signals.subscribe()
    }

    pub fn current(&self) -> EndpointState {
        self.states.borrow().clone()
    }

    pub fn set_active(&self) -> bool {
        self.transition(EndpointState::Active)
    }

    pub fn set_closed(&self) -> bool {
        self.transition(EndpointState::Closed)
    }

    pub fn set_error(&self, error: ClientError) -> bool {
        self.transition(EndpointState::Errored(error))
    }

    pub fn signal_shutdown(&self, signal: ShutdownSignal) -> bool {
        self.signals.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(signal);
            true
        })
    }

    // Terminal states are sticky; repeated identical states are not re-published.
    fn transition(&self, next: EndpointState) -> bool {
        self.states.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            if next == EndpointState::Active {
                self.activated.store(true, Ordering::SeqCst);
            }
            *current = next;
            true
        })
    }
}

impl Default for EndpointStateTracker {
    fn default() -> Self {
        Self::new()
    }
}
