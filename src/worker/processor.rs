//! Processing of a single leased event.
//!
//! The processor owns the transform → publish → record-outcome sequence for
//! one event. Processing failures never escape: they are recorded on the
//! event through the retry/dead-letter state machine. Only store-level
//! infrastructure errors propagate to the caller.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::WorkerError;
use crate::broker::MessagePublisher;
use crate::config::{ConfigRegistry, DEFAULT_RETRY_LIMIT};
use crate::metrics::PipelineMetrics;
use crate::store::{EventStore, FailureTransition, SyncEvent};
use crate::transform::{DomainEventPublisher, TransformOutcome, transform};

/// Transforms, publishes, and records the outcome for leased events.
pub struct EventProcessor<B> {
    store: Arc<EventStore>,
    configs: ConfigRegistry,
    publisher: DomainEventPublisher<B>,
    metrics: Arc<PipelineMetrics>,
}

impl<B: MessagePublisher> EventProcessor<B> {
    pub fn new(
        store: Arc<EventStore>,
        configs: ConfigRegistry,
        publisher: DomainEventPublisher<B>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        EventProcessor {
            store,
            configs,
            publisher,
            metrics,
        }
    }

    /// Processes one leased event to a terminal-or-retrying outcome.
    ///
    /// - transform yields events → publish them all; success completes the
    ///   event, a publish failure feeds the retry state machine
    /// - transform skips (missing prerequisites) → the event completes with
    ///   nothing published; the skip is logged with the missing fields
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn process(&self, event: &SyncEvent) -> Result<(), WorkerError> {
        match transform(event) {
            TransformOutcome::Skipped { missing } => {
                info!(
                    event_id = %event.id,
                    missing = ?missing,
                    "Skipped: missing fields; completing without publish"
                );
                self.store.record_success(&event.id)?;
                self.metrics.record_skipped();
                self.metrics.record_succeeded();
                Ok(())
            }
            TransformOutcome::Events(events) => {
                match self.publisher.publish_all(events).await {
                    Ok(published) => {
                        debug!(event_id = %event.id, published, "Event processed");
                        self.store.record_success(&event.id)?;
                        self.metrics.record_succeeded();
                        Ok(())
                    }
                    Err(e) => self.record_failure(event, &e.to_string()),
                }
            }
        }
    }

    /// Records a processing failure through the retry/dead-letter rule.
    ///
    /// The retry limit and delay are read from the owning configuration at
    /// failure time, not cached on the event; a deleted configuration falls
    /// back to the fixed default limit.
    fn record_failure(&self, event: &SyncEvent, error: &str) -> Result<(), WorkerError> {
        let (retry_limit, retry_delay) = match self.configs.get(&event.config_id) {
            Some(config) => (config.retry_limit, config.retry_delay()),
            None => {
                warn!(
                    event_id = %event.id,
                    config_id = %event.config_id,
                    "Owning configuration missing; using default retry limit"
                );
                (DEFAULT_RETRY_LIMIT, std::time::Duration::ZERO)
            }
        };

        let transition = self
            .store
            .record_failure(&event.id, error, retry_limit, retry_delay)?;

        match transition {
            FailureTransition::Retrying { retry_count } => {
                warn!(
                    event_id = %event.id,
                    retry_count,
                    retry_limit,
                    error,
                    "Event failed; will retry"
                );
                self.metrics.record_retried();
            }
            FailureTransition::DeadLetter { attempts } => {
                self.metrics.record_dead_lettered();
                warn!(
                    event_id = %event.id,
                    attempts,
                    error,
                    "Event failed past retry limit; dead-lettered"
                );
            }
        }
        Ok(())
    }
}
