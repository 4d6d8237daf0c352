//! Durable event store and lease manager.
//!
//! The store holds every received [`SyncEvent`] and hands out exclusive
//! batches of work. All state lives in memory behind one lock and every
//! mutation is journaled; on startup the journal is replayed to rebuild the
//! map.
//!
//! # Lease Exclusivity
//!
//! `lease_batch` performs a per-event compare-and-swap: an event is claimed
//! only if its observed status is still leasable at the moment of the flip,
//! and the check and the flip happen under the same lock (the locking-read
//! equivalent of `UPDATE … WHERE id = ? AND status IN (PENDING, RETRYING)`).
//! Two concurrent callers can therefore never claim the same event.
//!
//! # Crash Recovery
//!
//! An event found in `Processing` during replay was leased by a worker that
//! never reported an outcome. It is demoted to `Retrying` without consuming
//! retry budget, so no event is ever stranded in `Processing`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

pub mod event;
pub mod journal;
pub mod transitions;

pub use event::{DeadLetterRecord, ProcessingStatus, SyncEvent};
pub use journal::{Journal, JournalError, JournalRecord};
pub use transitions::{FailureTransition, plan_failure};

use crate::types::{ConfigId, EventId, TenantId};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Journal operation failed.
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The referenced event does not exist.
    #[error("unknown event: {0}")]
    UnknownEvent(EventId),

    /// The requested transition is not legal from the event's current status.
    #[error("invalid transition for event {id}: {from:?} is not {expected}")]
    InvalidTransition {
        id: EventId,
        from: ProcessingStatus,
        expected: &'static str,
    },
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Fields of a new event at enqueue time; everything else is generated.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub config_id: ConfigId,
    pub tenant_id: TenantId,
    pub source: String,
    pub event_type: String,
    pub external_id: Option<String>,
    pub payload: serde_json::Value,
}

struct StoreInner {
    /// All events, keyed by id. Events are never removed.
    events: HashMap<EventId, SyncEvent>,

    /// Event ids in arrival order, for oldest-first leasing.
    arrival: Vec<EventId>,

    /// The append-only journal backing the map.
    journal: Journal,
}

/// Durable store of sync events with exclusive batch leasing.
pub struct EventStore {
    inner: Mutex<StoreInner>,
}

impl EventStore {
    /// Opens the store backed by the journal at `path`, replaying any
    /// existing entries and demoting abandoned `Processing` events to
    /// `Retrying`.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let (mut journal, entries) = Journal::open(path)?;

        let mut events: HashMap<EventId, SyncEvent> = HashMap::new();
        let mut arrival: Vec<EventId> = Vec::new();

        for entry in entries {
            match entry.record {
                JournalRecord::Enqueued { event } => {
                    arrival.push(event.id.clone());
                    events.insert(event.id.clone(), event);
                }
                JournalRecord::Leased { id } => {
                    if let Some(event) = events.get_mut(&id) {
                        event.status = ProcessingStatus::Processing;
                    }
                }
                JournalRecord::Completed { id } => {
                    if let Some(event) = events.get_mut(&id) {
                        event.status = ProcessingStatus::Completed;
                        event.error_message = None;
                    }
                }
                JournalRecord::Retrying {
                    id,
                    retry_count,
                    error,
                    not_before,
                } => {
                    if let Some(event) = events.get_mut(&id) {
                        event.status = ProcessingStatus::Retrying;
                        event.retry_count = retry_count;
                        event.error_message = Some(error);
                        event.not_before = not_before;
                    }
                }
                JournalRecord::DeadLettered { id, record } => {
                    if let Some(event) = events.get_mut(&id) {
                        event.status = ProcessingStatus::DeadLetter;
                        event.retry_count = record.attempts;
                        event.error_message = Some(record.error.clone());
                        event.dead_letter = Some(record);
                    }
                }
                JournalRecord::Released { id } => {
                    if let Some(event) = events.get_mut(&id) {
                        event.status = ProcessingStatus::Retrying;
                    }
                }
            }
        }

        // Demote events abandoned mid-lease by a crash. The attempt never
        // reported an outcome, so retry_count is left untouched.
        let mut recovered = 0usize;
        for id in &arrival {
            if let Some(event) = events.get_mut(id)
                && event.status == ProcessingStatus::Processing
            {
                event.status = ProcessingStatus::Retrying;
                journal.append(JournalRecord::Released { id: id.clone() })?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            journal.sync()?;
            warn!(recovered, "Recovered events abandoned in processing");
        }

        Ok(EventStore {
            inner: Mutex::new(StoreInner {
                events,
                arrival,
                journal,
            }),
        })
    }

    /// Inserts a new event with status `Pending` and a zero retry count.
    ///
    /// The journal write (with fsync) completes before this returns, so a
    /// 2xx acknowledgement to the webhook caller implies durability.
    pub fn enqueue(&self, new: NewEvent) -> Result<SyncEvent> {
        let event = SyncEvent {
            id: EventId::generate(),
            config_id: new.config_id,
            tenant_id: new.tenant_id,
            source: new.source,
            event_type: new.event_type,
            external_id: new.external_id,
            payload: new.payload,
            status: ProcessingStatus::Pending,
            retry_count: 0,
            error_message: None,
            dead_letter: None,
            received_at: Utc::now(),
            not_before: None,
        };

        let mut inner = self.lock();
        inner.journal.append(JournalRecord::Enqueued {
            event: event.clone(),
        })?;
        inner.arrival.push(event.id.clone());
        inner.events.insert(event.id.clone(), event.clone());

        debug!(event_id = %event.id, config_id = %event.config_id, "Enqueued event");
        Ok(event)
    }

    /// Claims up to `limit` leasable events, oldest first, flipping each to
    /// `Processing`.
    ///
    /// Check and flip happen atomically per event under the store lock, so
    /// concurrent callers never receive overlapping batches. `Retrying`
    /// events whose `not_before` is still in the future are skipped.
    pub fn lease_batch(&self, limit: usize) -> Result<Vec<SyncEvent>> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut leased = Vec::new();

        // Walk arrival order; ids are never removed so this preserves
        // oldest-first fairness.
        let candidates: Vec<EventId> = inner
            .arrival
            .iter()
            .filter(|id| {
                inner
                    .events
                    .get(*id)
                    .is_some_and(|e| e.is_leasable_at(now))
            })
            .take(limit)
            .cloned()
            .collect();

        for id in candidates {
            // Per-event CAS: re-check status before the flip. Under this
            // lock the re-check cannot race, but it keeps the operation
            // correct if leasing is ever split across finer locks.
            let Some(event) = inner.events.get_mut(&id) else {
                continue;
            };
            if !event.is_leasable_at(now) {
                continue;
            }
            event.status = ProcessingStatus::Processing;
            let snapshot = event.clone();
            inner.journal.append(JournalRecord::Leased { id })?;
            leased.push(snapshot);
        }

        if !leased.is_empty() {
            debug!(count = leased.len(), "Leased batch");
        }
        Ok(leased)
    }

    /// Records a successful outcome: `Processing` → `Completed`, error
    /// message cleared.
    pub fn record_success(&self, id: &EventId) -> Result<()> {
        let mut inner = self.lock();
        let event = inner
            .events
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownEvent(id.clone()))?;

        if event.status != ProcessingStatus::Processing {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from: event.status,
                expected: "PROCESSING",
            });
        }

        event.status = ProcessingStatus::Completed;
        event.error_message = None;
        event.not_before = None;
        inner
            .journal
            .append(JournalRecord::Completed { id: id.clone() })?;
        Ok(())
    }

    /// Records a failed outcome for a leased event.
    ///
    /// Applies the retry/dead-letter rule against `retry_limit` and returns
    /// the transition taken. On `Retrying`, the event becomes eligible again
    /// after `retry_delay`; on `DeadLetter`, the full dead-letter record is
    /// persisted and the event is terminal.
    pub fn record_failure(
        &self,
        id: &EventId,
        error: &str,
        retry_limit: u32,
        retry_delay: Duration,
    ) -> Result<FailureTransition> {
        let now = Utc::now();
        let mut inner = self.lock();
        let event = inner
            .events
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownEvent(id.clone()))?;

        if event.status != ProcessingStatus::Processing {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from: event.status,
                expected: "PROCESSING",
            });
        }

        let transition = plan_failure(event.retry_count, retry_limit);
        let record = match &transition {
            FailureTransition::Retrying { retry_count } => {
                let not_before = (!retry_delay.is_zero()).then(|| {
                    now + chrono::Duration::from_std(retry_delay)
                        .unwrap_or_else(|_| chrono::Duration::zero())
                });
                event.status = ProcessingStatus::Retrying;
                event.retry_count = *retry_count;
                event.error_message = Some(error.to_string());
                event.not_before = not_before;
                JournalRecord::Retrying {
                    id: id.clone(),
                    retry_count: *retry_count,
                    error: error.to_string(),
                    not_before,
                }
            }
            FailureTransition::DeadLetter { attempts } => {
                let dead_letter = DeadLetterRecord {
                    payload: event.payload.clone(),
                    error: error.to_string(),
                    failed_at: now,
                    attempts: *attempts,
                };
                event.status = ProcessingStatus::DeadLetter;
                event.retry_count = *attempts;
                event.error_message = Some(error.to_string());
                event.dead_letter = Some(dead_letter.clone());
                warn!(event_id = %id, attempts, "Event dead-lettered");
                JournalRecord::DeadLettered {
                    id: id.clone(),
                    record: dead_letter,
                }
            }
        };

        inner.journal.append(record)?;
        Ok(transition)
    }

    /// Releases a lease without recording an outcome: `Processing` →
    /// `Retrying`, retry budget untouched.
    ///
    /// Used at shutdown so an in-flight batch never strands events in
    /// `Processing`.
    pub fn release_lease(&self, id: &EventId) -> Result<()> {
        let mut inner = self.lock();
        let event = inner
            .events
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownEvent(id.clone()))?;

        if event.status != ProcessingStatus::Processing {
            return Err(StoreError::InvalidTransition {
                id: id.clone(),
                from: event.status,
                expected: "PROCESSING",
            });
        }

        event.status = ProcessingStatus::Retrying;
        inner
            .journal
            .append(JournalRecord::Released { id: id.clone() })?;
        Ok(())
    }

    /// Returns a snapshot of an event by id.
    pub fn get(&self, id: &EventId) -> Option<SyncEvent> {
        self.lock().events.get(id).cloned()
    }

    /// Returns snapshots of all dead-lettered events, oldest first.
    pub fn dead_letters(&self) -> Vec<SyncEvent> {
        let inner = self.lock();
        inner
            .arrival
            .iter()
            .filter_map(|id| inner.events.get(id))
            .filter(|e| e.status == ProcessingStatus::DeadLetter)
            .cloned()
            .collect()
    }

    /// Returns the number of events currently in each status.
    pub fn status_counts(&self) -> HashMap<ProcessingStatus, usize> {
        let inner = self.lock();
        let mut counts = HashMap::new();
        for event in inner.events.values() {
            *counts.entry(event.status).or_insert(0) += 1;
        }
        counts
    }

    /// Returns the total number of events ever enqueued.
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    /// Returns true if the store holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forces an fsync of the journal.
    ///
    /// The poller calls this once per batch to bound the window of
    /// non-critical records that a crash could lose.
    pub fn sync(&self) -> Result<()> {
        self.lock().journal.sync()?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        // A poisoned lock means a panic while mutating store state; the map
        // and journal may disagree, so propagating the panic is the only
        // safe option.
        self.inner.lock().expect("event store lock poisoned")
    }
}
