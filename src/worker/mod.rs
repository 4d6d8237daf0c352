//! Producer-side worker system: lease polling and event processing.
//!
//! A single [`Poller`] drives the producer half of the pipeline. On each
//! tick it leases a batch of eligible events from the store and hands them,
//! strictly sequentially, to the [`EventProcessor`], which transforms,
//! publishes, and records the outcome through the retry/dead-letter state
//! machine.
//!
//! # Module Structure
//!
//! - [`poller`]: the fixed-interval loop with the single-flight guard and
//!   shutdown lease release
//! - [`processor`]: per-event transform → publish → record-outcome sequence

mod poller;
mod processor;

#[cfg(test)]
mod tests;

pub use poller::{Poller, PollerConfig};
pub use processor::EventProcessor;

use thiserror::Error;

use crate::store::StoreError;

/// Errors that can occur during worker operations.
///
/// These are infrastructure errors (the store itself failing); ordinary
/// processing failures are recorded on the affected event instead.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Event store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
