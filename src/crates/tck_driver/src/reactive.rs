//! Flow-controlled stream contract shared by the driver and the transports.
//!
//! A [`Publisher`] is subscribed exactly once. It hands its [`Subscriber`] a
//! [`Subscription`] through `on_subscribe`, after which items flow only as far as
//! the subscriber has signalled demand through [`Subscription::request`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Data and metadata carried by every protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload {
    /// Application data.
    pub data: String,
    /// Application metadata.
    pub metadata: String,
}

impl Payload {
    /// Data and metadata of the shutdown payload.
    pub const SHUTDOWN: &'static str = "shutdown";

    /// Payload of `data` and `metadata`.
    pub fn new(data: impl Into<String>, metadata: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            metadata: metadata.into(),
        }
    }

    /// Reserved payload telling the remote peer to drop shared state for the connection.
    pub fn shutdown() -> Self {
        Self::new(Self::SHUTDOWN, Self::SHUTDOWN)
    }

    /// True for the reserved shutdown payload.
    pub fn is_shutdown(&self) -> bool {
        self.data == Self::SHUTDOWN && self.metadata == Self::SHUTDOWN
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.data, self.metadata)
    }
}

/// Error signal delivered to a subscriber when a stream terminates abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    /// Reason given by whoever terminated the stream.
    pub message: String,
}

impl StreamError {
    /// Error carrying `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Demand and cancellation handle a producer gives to its subscriber.
pub trait Subscription: Send + Sync {
    /// Grant `n` more items. Zero is ignored.
    fn request(&self, n: u64);
    /// Stop the stream. Idempotent.
    fn cancel(&self);
}

/// Receiver of a stream's signals. Callbacks may arrive from any thread.
pub trait Subscriber<T>: Send + Sync {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>);
    fn on_next(&self, item: T);
    fn on_error(&self, error: StreamError);
    fn on_complete(&self);
}

/// One-shot source of items.
pub trait Publisher<T>: Send {
    /// Attach `subscriber`; it receives `on_subscribe` first.
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<T>>);
}

/// Owned, type-erased publisher.
pub type BoxPublisher<T> = Box<dyn Publisher<T>>;
