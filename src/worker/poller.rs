//! The lease poller: a fixed-interval timer driving batch processing.
//!
//! Each tick leases a batch of eligible events and processes them strictly
//! sequentially before the next tick can do anything. The interval skips
//! missed ticks rather than bunching them, and the tick body runs inline in
//! the loop, so two cycles can never overlap within one poller (the
//! single-flight guard). Lease exclusivity in the store protects against
//! concurrent poller *instances*.
//!
//! # Shutdown
//!
//! Cancellation is observed between events within a batch. Remaining leased
//! events are released back to an eligible status, so stopping the pipeline
//! never strands an event in `Processing`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::WorkerError;
use super::processor::EventProcessor;
use crate::broker::MessagePublisher;
use crate::store::EventStore;

/// Default interval between poll ticks.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;

/// Default maximum number of events leased per tick.
const DEFAULT_BATCH_SIZE: usize = 25;

/// Configuration for the poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Interval between poll ticks.
    ///
    /// Default: 10 seconds. Configure via `COGNI_SYNC_POLL_INTERVAL_SECS`.
    pub interval: Duration,

    /// Maximum events leased per tick. Batches are small by design: one bad
    /// event delays only its batch-mates.
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PollerConfig {
    /// Creates a `PollerConfig` with default values.
    pub fn new() -> Self {
        PollerConfig {
            interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Creates a `PollerConfig` from environment variables.
    ///
    /// Reads `COGNI_SYNC_POLL_INTERVAL_SECS` for the poll interval and
    /// `COGNI_SYNC_BATCH_SIZE` for the batch size. Other values use
    /// defaults.
    pub fn from_env() -> Self {
        let interval_secs = std::env::var("COGNI_SYNC_POLL_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        let batch_size = std::env::var("COGNI_SYNC_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_BATCH_SIZE);

        PollerConfig {
            interval: Duration::from_secs(interval_secs),
            batch_size,
        }
    }
}

/// Periodically leases and processes batches of eligible events.
pub struct Poller<B> {
    store: Arc<EventStore>,
    processor: EventProcessor<B>,
    config: PollerConfig,
}

impl<B: MessagePublisher> Poller<B> {
    pub fn new(store: Arc<EventStore>, processor: EventProcessor<B>, config: PollerConfig) -> Self {
        Poller {
            store,
            processor,
            config,
        }
    }

    /// Runs the poll loop until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Poller started"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        // A tick that would fire while a batch is still processing is
        // skipped, not queued: the single-flight guard.
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle(&shutdown).await {
                        // Infrastructure errors must not crash the poller;
                        // the next tick retries from stored state.
                        error!(error = %e, "Poll cycle failed");
                    }
                }
            }
        }

        info!("Poller stopped");
    }

    /// Leases one batch and processes it sequentially.
    ///
    /// Public so tests (and manual drain tooling) can drive cycles without
    /// the timer. Returns the number of events leased.
    #[instrument(skip(self, shutdown))]
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<usize, WorkerError> {
        let batch = self.store.lease_batch(self.config.batch_size)?;
        if batch.is_empty() {
            return Ok(0);
        }

        debug!(count = batch.len(), "Processing leased batch");

        for (index, event) in batch.iter().enumerate() {
            // Observe shutdown between events: release everything not yet
            // processed, including this event, back to eligibility.
            if shutdown.is_cancelled() {
                for abandoned in &batch[index..] {
                    if let Err(e) = self.store.release_lease(&abandoned.id) {
                        error!(
                            event_id = %abandoned.id,
                            error = %e,
                            "Failed to release lease on shutdown"
                        );
                    }
                }
                debug!(
                    released = batch.len() - index,
                    "Shutdown mid-batch; released remaining leases"
                );
                break;
            }

            // Each event's failure is isolated: processing outcomes are
            // recorded on the event, and even a store error moving to the
            // next event beats abandoning the rest of the batch.
            if let Err(e) = self.processor.process(event).await {
                error!(event_id = %event.id, error = %e, "Failed to record outcome");
            }
        }

        // Bound the window of journal records a crash could lose.
        self.store.sync()?;

        Ok(batch.len())
    }
}
