use std::sync::Arc;

use crate::error::DriverResult;
use crate::reactive::{BoxPublisher, Payload};

/// A logical connection to the peer under test.
///
/// Every operation returns a cold publisher: nothing is sent until the returned
/// publisher is subscribed and demand is signalled.
pub trait ReactiveConnection: Send + Sync {
    /// Zero or one item.
    fn request_response(&self, payload: Payload) -> BoxPublisher<Payload>;
    /// Zero or more items, then a terminal signal.
    fn request_stream(&self, payload: Payload) -> BoxPublisher<Payload>;
    /// Zero or more items over a long-lived subscription.
    fn request_subscription(&self, payload: Payload) -> BoxPublisher<Payload>;
    /// No items; completes once the message has been handed to the transport.
    fn fire_and_forget(&self, payload: Payload) -> BoxPublisher<()>;
    /// Bidirectional: the peer subscribes to `outbound`, the returned publisher carries
    /// the peer's items.
    fn request_channel(&self, outbound: BoxPublisher<Payload>) -> BoxPublisher<Payload>;
}

/// Produces a ready-to-use connection on demand.
pub trait ConnectionFactory: Send + Sync {
    fn connect(&self) -> DriverResult<Arc<dyn ReactiveConnection>>;
}

impl<F> ConnectionFactory for F
where
    F: Fn() -> DriverResult<Arc<dyn ReactiveConnection>> + Send + Sync,
{
    fn connect(&self) -> DriverResult<Arc<dyn ReactiveConnection>> {
        self()
    }
}
