//! Event bus: envelope, topic routing, durable queues and consumers.

pub mod consumer;
pub mod exchange;
pub mod topic;
pub mod types;

pub use consumer::{EventConsumer, EventHandler, FailurePolicy, FnHandler};
pub use exchange::{DeadLetter, Delivery, QueueStatsSnapshot, TopicExchange};
pub use topic::TopicPattern;
pub use types::{Event, EventType, WireMessage, routing};

/// Anything engines can publish events through.
///
/// Publishing never blocks: it returns `false` when the event could not be
/// handed to every matching queue.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: &Event, routing_key: &str) -> bool;
}
