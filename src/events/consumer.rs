//! Queue consumer with per-pattern handler dispatch.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::exchange::{DeadLetter, Delivery, Queue, QueueStatsSnapshot, TopicExchange};
use super::topic::TopicPattern;
use super::types::Event;
use crate::error::{BusError, Error, HandlerError};

/// Handles events delivered for one binding pattern.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), HandlerError>;
}

type BoxedHandlerFn = Box<
    dyn Fn(Event) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>> + Send + Sync,
>;

/// Adapts an async closure into an [`EventHandler`].
pub struct FnHandler(BoxedHandlerFn);

impl FnHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self(Box::new(move |event| Box::pin(f(event))))
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    async fn handle(&self, event: Event) -> Result<(), HandlerError> {
        (self.0)(event).await
    }
}

/// What happens to a delivery whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Negative acknowledgement without requeue; the delivery is gone.
    #[default]
    Drop,
    /// Park the delivery for inspection and replay.
    DeadLetter,
    /// Re-enqueue up to `max_attempts` total attempts, then park it.
    Retry { max_attempts: u32 },
}

/// Consumer of one service queue.
///
/// Handlers are registered before [`start_consuming`](Self::start_consuming),
/// which takes the consumer by value, so the handler table cannot change
/// while deliveries are being processed.
pub struct EventConsumer {
    service_name: String,
    exchange: Arc<TopicExchange>,
    queue: Arc<Queue>,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    policy: FailurePolicy,
}

impl EventConsumer {
    /// Declare (or reuse) the `{service_name}_queue` queue.
    pub fn new(exchange: Arc<TopicExchange>, service_name: &str, policy: FailurePolicy) -> Self {
        let queue = exchange.declare_queue(&format!("{service_name}_queue"));
        Self {
            service_name: service_name.to_string(),
            exchange,
            queue,
            handlers: HashMap::new(),
            policy,
        }
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn queue(&self) -> Arc<Queue> {
        Arc::clone(&self.queue)
    }

    /// Bind `pattern` to this consumer's queue and register its handler.
    pub fn subscribe(
        &mut self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        let parsed = TopicPattern::parse(pattern)?;
        if self.handlers.contains_key(parsed.as_str()) {
            return Err(BusError::DuplicateHandler {
                queue: self.queue.name().to_string(),
                pattern: pattern.to_string(),
            });
        }
        self.exchange.bind(self.queue.name(), pattern)?;
        self.handlers.insert(parsed.as_str().to_string(), handler);
        info!(
            service = %self.service_name,
            queue = %self.queue.name(),
            pattern,
            "Subscribed"
        );
        Ok(())
    }

    /// Closure form of [`subscribe`](Self::subscribe).
    pub fn subscribe_fn<F, Fut>(&mut self, pattern: &str, f: F) -> Result<(), BusError>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe(pattern, Arc::new(FnHandler::new(f)))
    }

    /// Process deliveries one at a time until the exchange closes.
    ///
    /// Undelivered messages remain in the queue for the next consumer.
    pub async fn start_consuming(self) -> Result<QueueStatsSnapshot, BusError> {
        let mut rx = self
            .queue
            .take_receiver()
            .ok_or_else(|| BusError::AlreadyConsuming(self.queue.name().to_string()))?;
        let mut shutdown = self.exchange.shutdown_signal();

        info!(
            service = %self.service_name,
            queue = %self.queue.name(),
            handlers = self.handlers.len(),
            "Consumer started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                delivery = rx.recv() => match delivery {
                    Some(delivery) => self.dispatch(delivery).await,
                    None => break,
                },
            }
        }

        self.queue.return_receiver(rx);
        let stats = self.queue.stats();
        info!(
            service = %self.service_name,
            queue = %self.queue.name(),
            acked = stats.acked,
            nacked = stats.nacked,
            "Consumer stopped"
        );
        Ok(stats)
    }

    async fn dispatch(&self, delivery: Delivery) {
        self.queue.stats.delivered.fetch_add(1, Ordering::Relaxed);

        let Some(handler) = self.handlers.get(&delivery.matched_pattern) else {
            let err = HandlerError::NoHandler(delivery.matched_pattern.clone());
            self.reject(delivery, err, false);
            return;
        };

        let event = match delivery.message.decode() {
            Ok(event) => event,
            Err(e) => {
                self.reject(delivery, HandlerError::Engine(Error::Bus(e)), false);
                return;
            }
        };

        debug!(
            queue = %self.queue.name(),
            routing_key = %delivery.message.routing_key,
            event_id = %event.event_id,
            trace_id = %event.trace_id,
            attempt = delivery.attempt,
            "Dispatching event"
        );

        let outcome = AssertUnwindSafe(handler.handle(event))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(HandlerError::Panicked(panic_message(panic))));

        match outcome {
            Ok(()) => {
                self.queue.stats.acked.fetch_add(1, Ordering::Relaxed);
                debug!(delivery_tag = delivery.delivery_tag, "Acked");
            }
            Err(e) => self.reject(delivery, e, true),
        }
    }

    fn reject(&self, mut delivery: Delivery, err: HandlerError, retryable: bool) {
        self.queue.stats.nacked.fetch_add(1, Ordering::Relaxed);
        error!(
            queue = %self.queue.name(),
            routing_key = %delivery.message.routing_key,
            delivery_tag = delivery.delivery_tag,
            attempt = delivery.attempt,
            error = %err,
            "Handler failed, nacking delivery"
        );

        match self.policy {
            FailurePolicy::Drop => {}
            FailurePolicy::DeadLetter => self.park(delivery, &err),
            FailurePolicy::Retry { max_attempts } => {
                if retryable && delivery.attempt < max_attempts {
                    delivery.attempt += 1;
                    delivery.delivery_tag = self.exchange.next_delivery_tag();
                    if self.queue.enqueue(delivery.clone()) {
                        self.queue.stats.retried.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    warn!(queue = %self.queue.name(), "Retry enqueue failed, parking delivery");
                }
                self.park(delivery, &err);
            }
        }
    }

    fn park(&self, delivery: Delivery, err: &HandlerError) {
        self.queue.park(DeadLetter {
            delivery,
            error: err.to_string(),
            failed_at: Utc::now(),
        });
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
