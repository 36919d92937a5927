//! In-process durable topic exchange.
//!
//! Each consumer owns one named queue. A queue outlives its consumer:
//! deliveries published while nobody is consuming stay buffered until the
//! next `start_consuming`. Declarations are idempotent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::EventPublisher;
use super::topic::TopicPattern;
use super::types::{Event, WireMessage};
use crate::error::BusError;

/// Default per-queue buffer size.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// One message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    /// The binding pattern that routed this message into the queue.
    pub matched_pattern: String,
    pub message: WireMessage,
    /// 1 on first delivery, incremented on each retry.
    pub attempt: u32,
}

/// A delivery that was negatively acknowledged and parked.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub delivery: Delivery,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Counters for a single queue.
#[derive(Debug, Default)]
pub struct QueueStats {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    /// Re-enqueued by the retry policy or a dead-letter replay.
    pub retried: AtomicU64,
    pub dead_lettered: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl QueueStatsSnapshot {
    /// Deliveries enqueued but not yet acked or nacked.
    pub fn in_flight(&self) -> u64 {
        (self.published + self.retried).saturating_sub(self.acked + self.nacked)
    }
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// A durable named queue bound to the exchange.
pub struct Queue {
    name: String,
    bindings: RwLock<Vec<TopicPattern>>,
    tx: mpsc::Sender<Delivery>,
    rx: Mutex<Option<mpsc::Receiver<Delivery>>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    pub(crate) stats: QueueStats,
}

impl Queue {
    fn new(name: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: name.to_string(),
            bindings: RwLock::new(Vec::new()),
            tx,
            rx: Mutex::new(Some(rx)),
            dead_letters: Mutex::new(Vec::new()),
            stats: QueueStats::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bind a pattern. Binding the same pattern twice is a no-op.
    pub(crate) fn bind(&self, pattern: TopicPattern) {
        let mut bindings = self.bindings.write().unwrap_or_else(PoisonError::into_inner);
        if !bindings.contains(&pattern) {
            bindings.push(pattern);
        }
    }

    /// First bound pattern (in bind order) that matches `routing_key`.
    fn route(&self, routing_key: &str) -> Option<String> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        bindings
            .iter()
            .find(|p| p.matches(routing_key))
            .map(|p| p.as_str().to_string())
    }

    pub(crate) fn enqueue(&self, delivery: Delivery) -> bool {
        match self.tx.try_send(delivery) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(d)) => {
                warn!(queue = %self.name, routing_key = %d.message.routing_key, "Queue full, delivery rejected");
                false
            }
            Err(mpsc::error::TrySendError::Closed(d)) => {
                warn!(queue = %self.name, routing_key = %d.message.routing_key, "Queue closed, delivery rejected");
                false
            }
        }
    }

    pub(crate) fn take_receiver(&self) -> Option<mpsc::Receiver<Delivery>> {
        self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub(crate) fn return_receiver(&self, rx: mpsc::Receiver<Delivery>) {
        *self.rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
    }

    pub(crate) fn park(&self, dead: DeadLetter) {
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(dead);
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move every parked delivery back onto the queue as a fresh attempt.
    /// Returns how many were re-enqueued; the rest stay parked.
    pub fn replay_dead_letters(&self) -> usize {
        let parked: Vec<DeadLetter> = std::mem::take(
            &mut *self.dead_letters.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut replayed = 0;
        let mut still_parked = Vec::new();
        for dead in parked {
            let mut delivery = dead.delivery.clone();
            delivery.attempt = 1;
            if self.enqueue(delivery) {
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                replayed += 1;
            } else {
                still_parked.push(dead);
            }
        }
        if !still_parked.is_empty() {
            self.dead_letters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(still_parked);
        }
        info!(queue = %self.name, replayed, "Replayed dead letters");
        replayed
    }
}

/// Durable topic exchange routing events to bound queues.
pub struct TopicExchange {
    name: String,
    capacity: usize,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    next_tag: AtomicU64,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl TopicExchange {
    /// Create a new exchange.
    pub fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        let (shutdown_tx, _rx) = watch::channel(false);
        let name = name.into();
        debug!(exchange = %name, "Declared topic exchange");
        Arc::new(Self {
            name,
            capacity,
            queues: RwLock::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a durable queue, or return the existing one of that name.
    pub fn declare_queue(&self, name: &str) -> Arc<Queue> {
        {
            let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(queue) = queues.get(name) {
                return Arc::clone(queue);
            }
        }
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        let queue = queues
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(exchange = %self.name, queue = name, "Declared durable queue");
                Arc::new(Queue::new(name, self.capacity))
            });
        Arc::clone(queue)
    }

    /// Look up a declared queue.
    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Bind `pattern` to the named queue, declaring the queue if needed.
    /// A closed exchange accepts no new bindings.
    pub fn bind(&self, queue: &str, pattern: &str) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed(self.name.clone()));
        }
        let pattern = TopicPattern::parse(pattern)?;
        let queue = self.declare_queue(queue);
        debug!(queue = %queue.name(), pattern = %pattern.as_str(), "Bound queue");
        queue.bind(pattern);
        Ok(())
    }

    /// True when no queue has a delivery waiting or being handled.
    pub fn is_idle(&self) -> bool {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .all(|q| q.stats().in_flight() == 0)
    }

    pub(crate) fn next_delivery_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    /// Receiver that flips to `true` when the exchange closes.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting publishes and tell consumers to stop. Buffered
    /// deliveries stay in their queues.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(exchange = %self.name, "Closing exchange");
            self.shutdown_tx.send_replace(true);
        }
    }
}

impl EventPublisher for TopicExchange {
    fn publish(&self, event: &Event, routing_key: &str) -> bool {
        if self.is_closed() {
            warn!(
                exchange = %self.name,
                routing_key,
                event_type = event.event_type.as_str(),
                "Cannot publish: exchange closed"
            );
            return false;
        }

        let message = match WireMessage::encode(event, routing_key) {
            Ok(m) => m,
            Err(e) => {
                warn!(routing_key, error = %e, "Failed to encode event");
                return false;
            }
        };

        let queues: Vec<Arc<Queue>> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut ok = true;
        let mut routed = 0;
        for queue in queues {
            let Some(matched_pattern) = queue.route(routing_key) else {
                continue;
            };
            let delivery = Delivery {
                delivery_tag: self.next_delivery_tag(),
                matched_pattern,
                message: message.clone(),
                attempt: 1,
            };
            if queue.enqueue(delivery) {
                queue.stats.published.fetch_add(1, Ordering::Relaxed);
                routed += 1;
            } else {
                ok = false;
            }
        }

        info!(
            event_type = event.event_type.as_str(),
            trace_id = %event.trace_id,
            routing_key,
            routed,
            "Published event"
        );
        ok
    }
}
