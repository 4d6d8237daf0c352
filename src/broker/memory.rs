//! In-process broker with competing consumers and a dead-letter queue.
//!
//! Delivery semantics:
//! - `publish` appends to the topic queue (FIFO)
//! - any number of subscriptions compete for messages; each message is
//!   delivered to exactly one of them at a time
//! - a [`Delivery`] must be settled exactly once: acknowledged (removed) or
//!   dead-lettered (moved to the inspectable dead-letter queue with a reason)
//! - a delivery dropped without being settled is nacked back to the front of
//!   the queue, so an abandoned in-flight handler cannot lose a message

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::{BrokerError, BrokerMessage, MessagePublisher};

/// A message that a consumer gave up on, with the reason.
#[derive(Debug, Clone)]
pub struct DeadLetteredMessage {
    /// The original message.
    pub message: BrokerMessage,

    /// Short machine-meaningful reason (e.g., "unknown_message_type").
    pub reason: String,

    /// The originating error text.
    pub error: String,

    /// When the message was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

/// An in-process message broker.
///
/// Constructed once at startup and shared via `Arc`; closed during shutdown,
/// after which publishes fail and drained subscriptions end.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queue: Mutex<VecDeque<BrokerMessage>>,
    dead_letters: Mutex<Vec<DeadLetteredMessage>>,
    notify: Notify,
    closed: AtomicBool,
}

impl InMemoryBroker {
    /// Creates a new open broker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a subscription competing for messages on the topic.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        Subscription {
            broker: Arc::clone(self),
        }
    }

    /// Closes the broker: subsequent publishes fail, and subscriptions end
    /// once the remaining queue is drained.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of messages waiting in the topic queue.
    pub fn depth(&self) -> usize {
        self.lock_queue().len()
    }

    /// Snapshot of the dead-letter queue, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetteredMessage> {
        self.dead_letters
            .lock()
            .expect("broker dead-letter lock poisoned")
            .clone()
    }

    fn push_back(&self, message: BrokerMessage) {
        self.lock_queue().push_back(message);
        self.notify.notify_one();
    }

    fn push_front(&self, message: BrokerMessage) {
        self.lock_queue().push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<BrokerMessage> {
        self.lock_queue().pop_front()
    }

    fn record_dead_letter(&self, entry: DeadLetteredMessage) {
        warn!(
            message_id = %entry.message.message_id,
            reason = %entry.reason,
            "Message dead-lettered"
        );
        self.dead_letters
            .lock()
            .expect("broker dead-letter lock poisoned")
            .push(entry);
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<BrokerMessage>> {
        self.queue.lock().expect("broker queue lock poisoned")
    }
}

impl MessagePublisher for InMemoryBroker {
    type Error = BrokerError;

    async fn publish(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        debug!(message_id = %message.message_id, "Published message");
        self.push_back(message);
        Ok(())
    }
}

/// A competing-consumer subscription to the broker topic.
#[derive(Debug, Clone)]
pub struct Subscription {
    broker: Arc<InMemoryBroker>,
}

impl Subscription {
    /// Waits for the next message.
    ///
    /// Returns `None` once the broker is closed and the queue is drained.
    pub async fn recv(&self) -> Option<Delivery> {
        loop {
            // Register interest before checking the queue so a publish
            // between the check and the await cannot be missed.
            let notified = self.broker.notify.notified();

            if let Some(message) = self.broker.pop() {
                return Some(Delivery {
                    message: Some(message),
                    broker: Arc::clone(&self.broker),
                });
            }

            if self.broker.is_closed() {
                return None;
            }

            notified.await;
        }
    }
}

/// One in-flight message, owed exactly one settlement.
///
/// Consuming methods make double-settlement unrepresentable. Dropping an
/// unsettled delivery nacks the message back to the front of the queue.
#[derive(Debug)]
pub struct Delivery {
    message: Option<BrokerMessage>,
    broker: Arc<InMemoryBroker>,
}

impl Delivery {
    /// The delivered message.
    pub fn message(&self) -> &BrokerMessage {
        self.message
            .as_ref()
            .expect("message present until settled")
    }

    /// Acknowledges the message, removing it from the broker.
    pub fn ack(mut self) {
        let message = self.message.take().expect("delivery settled twice");
        debug!(message_id = %message.message_id, "Message acknowledged");
    }

    /// Dead-letters the message with a reason and the originating error.
    pub fn dead_letter(mut self, reason: impl Into<String>, error: impl Into<String>) {
        let message = self.message.take().expect("delivery settled twice");
        self.broker.record_dead_letter(DeadLetteredMessage {
            message,
            reason: reason.into(),
            error: error.into(),
            dead_lettered_at: Utc::now(),
        });
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        // Unsettled delivery: the handler was abandoned. Nack the message
        // back so it is redelivered rather than lost.
        if let Some(message) = self.message.take() {
            warn!(message_id = %message.message_id, "Unsettled delivery requeued");
            self.broker.push_front(message);
        }
    }
}
