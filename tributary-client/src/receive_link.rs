use crate::endpoint::Endpoint;
use crate::errors::Result;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tributary_core::{EventData, EventPosition};

/// Invoked by a link whose credits ran out; returns the number of credits to add.
pub type EmptyCreditListener = Arc<dyn Fn() -> u32 + Send + Sync>;

/// A receive link bound to one partition, with credit based flow control.
///
/// The broker pushes at most as many events as the link holds credits. Credits are
/// consumed one per delivered event.
pub trait ReceiveLink: Endpoint {
    /// Path of the entity the link reads from (`<event hub>/partitions/<id>`).
    fn entity_path(&self) -> &str;

    /// Events delivered by the link in arrival order.
    /// The stream ends once the link is closed or failed; it can be taken only once.
    fn receive(&self) -> BoxStream<'static, EventData>;

    fn add_credits(&self, credits: u32);

    fn credits(&self) -> u32;

    /// Replaces the listener consulted whenever the link runs out of credits.
    fn set_empty_credit_listener(&self, listener: EmptyCreditListener);
}

/// Creates receive links; the wire handshake lives behind this seam.
#[async_trait]
pub trait ReceiveLinkFactory: Send + Sync + 'static {
    async fn create_link(
        &self,
        partition_id: &str,
        position: EventPosition,
    ) -> Result<Arc<dyn ReceiveLink>>;
}
