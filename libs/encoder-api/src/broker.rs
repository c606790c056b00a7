use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::component::Component;
use crate::error::CollaboratorError;

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// The topic (filter) the subscription was opened for.
    pub subscription: String,
    /// The concrete topic the message was published on.
    pub topic: String,
    pub payload: Vec<u8>,
    /// Arrival time, Unix milliseconds.
    pub arrived_at_ms: i64,
}

/// Broker-side token for one live subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub topic: String,
}

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.topic, self.id)
    }
}

/// Receives messages for an open subscription.
///
/// The broker awaits `handle` before handing over the next message of the
/// same subscription, so per-subscription order is the broker's order.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: InboundMessage) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Publish/subscribe transport.
///
/// Delivery is at-most-once; no ordering across subscriptions.
pub trait Broker: Component {
    /// Open a subscription for `topic`. Resolves once the broker confirmed it.
    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Pin<Box<dyn Future<Output = Result<SubscriptionHandle, CollaboratorError>> + Send + '_>>;

    /// Close a subscription. `NotFound` if the broker already dropped it.
    fn unsubscribe(
        &self,
        handle: &SubscriptionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>>;
}
