//! Activity inboxes and outboxes
//!
//! Both sides of an activity's execution context sit on the SPSC ring from
//! [`super::queue`]. The inbox adds an async wake-up for its single consumer;
//! the outbox rings a doorbell so the outbound pump knows which lane to drain.

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

use super::command::Command;
use super::condition::Tier;
use super::error::{QueueError, QueueResult};
use super::queue::{self, Consumer, Producer};

/// Inbound command together with the tier it arrived from
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Tier whose broker delivered the command
    pub origin: Tier,
    /// The command itself
    pub command: Command,
}

impl Envelope {
    /// Wrap a command
    pub fn new(origin: Tier, command: Command) -> Self {
        Self { origin, command }
    }
}

/// Awaitable single-consumer queue
pub struct Inbox<T> {
    producer: Mutex<Producer<T>>,
    consumer: tokio::sync::Mutex<Consumer<T>>,
    notify: Notify,
    closed: AtomicBool,
    capacity: usize,
}

impl<T: Send> Inbox<T> {
    /// Create an inbox holding at least `capacity` items
    pub fn with_capacity(capacity: usize) -> Option<Self> {
        let (producer, consumer) = queue::bounded(capacity)?;
        let capacity = producer.capacity();
        Some(Self {
            producer: Mutex::new(producer),
            consumer: tokio::sync::Mutex::new(consumer),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            capacity,
        })
    }

    /// Enqueue an item and wake the consumer
    pub fn push(&self, item: T) -> QueueResult<()> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        self.producer
            .lock()
            .push(item)
            .map_err(|_| QueueError::Full {
                capacity: self.capacity,
            })?;
        self.notify.notify_one();
        Ok(())
    }

    /// Wait for the next item; `None` once closed and drained
    pub async fn recv(&self) -> Option<T> {
        let mut consumer = self.consumer.lock().await;
        loop {
            if let Some(item) = consumer.pop() {
                return Some(item);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Wait up to `timeout` for the next item
    pub async fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Stop accepting items and wake the consumer
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Whether the inbox was closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.producer.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ring capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Where the outbound pump should deliver a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every connected tier
    Broadcast,
    /// One specific tier
    Tier(Tier),
}

/// Command waiting for the outbound pump
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Destination
    pub target: Target,
    /// Command to send
    pub command: Command,
}

/// Ring shared between one outbox and the outbound pump
pub struct OutboundLane {
    producer: Mutex<Producer<Outbound>>,
    consumer: Mutex<Consumer<Outbound>>,
}

impl OutboundLane {
    /// Take every queued command, oldest first
    pub fn drain(&self) -> Vec<Outbound> {
        let mut consumer = self.consumer.lock();
        std::iter::from_fn(|| consumer.pop()).collect()
    }
}

/// Doorbell receiver handed to the outbound pump
pub type DoorbellReceiver = mpsc::UnboundedReceiver<Arc<OutboundLane>>;

/// Doorbell sender shared by every outbox
pub type Doorbell = mpsc::UnboundedSender<Arc<OutboundLane>>;

/// Create the doorbell channel
pub fn doorbell() -> (Doorbell, DoorbellReceiver) {
    mpsc::unbounded_channel()
}

/// Outbound queue of one execution context
pub struct Outbox {
    lane: Arc<OutboundLane>,
    doorbell: Doorbell,
    capacity: usize,
}

impl Outbox {
    /// Create an outbox holding at least `capacity` commands
    pub fn with_capacity(capacity: usize, doorbell: Doorbell) -> Option<Self> {
        let (producer, consumer) = queue::bounded(capacity)?;
        let capacity = producer.capacity();
        Some(Self {
            lane: Arc::new(OutboundLane {
                producer: Mutex::new(producer),
                consumer: Mutex::new(consumer),
            }),
            doorbell,
            capacity,
        })
    }

    /// Queue a command for the transport
    pub fn send(&self, target: Target, command: Command) -> QueueResult<()> {
        self.lane
            .producer
            .lock()
            .push(Outbound { target, command })
            .map_err(|_| QueueError::Full {
                capacity: self.capacity,
            })?;
        self.doorbell
            .send(self.lane.clone())
            .map_err(|_| QueueError::Closed)
    }

    /// Queue a command for every connected tier
    pub fn broadcast(&self, command: Command) -> QueueResult<()> {
        self.send(Target::Broadcast, command)
    }
}
