//! Publishing domain events to the broker.
//!
//! Events are handed to the broker one at a time, in the order produced. Any
//! publish failure aborts the remaining events in the batch and surfaces as
//! a retryable processing failure. Publishing is at-least-once, not
//! transactional: a partial publish before a failure is a possible outcome,
//! which is why the consumer side applies idempotently.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::debug;

use super::DomainEvent;
use crate::broker::MessagePublisher;
use crate::types::MessageId;

/// Default upper bound on a single broker publish call.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can occur while publishing a batch.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The broker rejected or failed the publish.
    #[error("publish failed for message {message_id}: {reason}")]
    Broker { message_id: MessageId, reason: String },

    /// The publish did not complete within the bounded timeout.
    #[error("publish timed out for message {message_id} after {timeout:?}")]
    Timeout {
        message_id: MessageId,
        timeout: Duration,
    },
}

/// Hands transformed domain events to the broker with a bounded per-message
/// timeout.
#[derive(Debug, Clone)]
pub struct DomainEventPublisher<B> {
    broker: Arc<B>,
    publish_timeout: Duration,
}

impl<B: MessagePublisher> DomainEventPublisher<B> {
    /// Creates a publisher over an injected broker client.
    pub fn new(broker: Arc<B>) -> Self {
        DomainEventPublisher {
            broker,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Overrides the per-message publish timeout.
    pub fn with_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    /// Publishes the events in order, aborting on the first failure.
    ///
    /// Returns the number of events published. Events after a failure are
    /// not attempted; the whole batch is retried by the state machine, and
    /// deterministic message ids let the consumer detect the replays.
    pub async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<usize, PublishError> {
        let mut published = 0usize;

        for event in events {
            let message_id = event.message_id.clone();
            let message = event.into_message();

            match timeout(self.publish_timeout, self.broker.publish(message)).await {
                Ok(Ok(())) => {
                    published += 1;
                }
                Ok(Err(e)) => {
                    return Err(PublishError::Broker {
                        message_id,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    return Err(PublishError::Timeout {
                        message_id,
                        timeout: self.publish_timeout,
                    });
                }
            }
        }

        debug!(published, "Published domain events");
        Ok(published)
    }
}
