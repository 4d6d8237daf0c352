//! Sync event records and their processing lifecycle.
//!
//! A [`SyncEvent`] is the unit of work in the pipeline: one received webhook
//! delivery, its raw payload, and its position in the processing state
//! machine. Events are created `Pending`, leased to `Processing`, and end in
//! `Completed` or `DeadLetter`. Events are never deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ConfigId, EventId, TenantId};

/// Processing state of a sync event.
///
/// Transitions are owned exclusively by the event store's lease and outcome
/// operations:
///
/// ```text
/// Pending ──lease──► Processing ──success──► Completed
///    ▲                   │  │
///    │                   │  └──failure (budget left)──► Retrying ──lease──► Processing
///    │                   └─────failure (budget spent)─► DeadLetter
///    └── (never re-entered once leased)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    /// Received and waiting for a first lease.
    Pending,

    /// Exclusively claimed by a worker. Never terminal.
    Processing,

    /// Terminal: processed successfully (including the nothing-to-publish
    /// skip case).
    Completed,

    /// Failed with retry budget remaining; eligible for re-lease.
    Retrying,

    /// Terminal: failed past the retry limit. Operator-visible only.
    DeadLetter,
}

impl ProcessingStatus {
    /// Returns true if the status is eligible for leasing.
    pub fn is_leasable(&self) -> bool {
        matches!(self, ProcessingStatus::Pending | ProcessingStatus::Retrying)
    }

    /// Returns true if the status is terminal (never leaves it).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessingStatus::Completed | ProcessingStatus::DeadLetter
        )
    }
}

/// Record persisted alongside an event when it is dead-lettered.
///
/// Populated only on terminal failure; carries everything an operator needs
/// to inspect or manually replay the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The event's raw payload at the time of the final failure.
    pub payload: serde_json::Value,

    /// Message of the failure that exhausted the retry budget.
    pub error: String,

    /// When the final failure was recorded.
    pub failed_at: DateTime<Utc>,

    /// Total processing attempts, including the final one.
    pub attempts: u32,
}

/// A received webhook delivery and its processing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Generated identifier, unique across the store.
    pub id: EventId,

    /// The sync configuration that owns this event.
    pub config_id: ConfigId,

    /// Tenant the owning configuration belongs to.
    pub tenant_id: TenantId,

    /// Upstream source system tag (e.g., "jira").
    pub source: String,

    /// Webhook event kind as reported by the upstream tool
    /// (e.g., "issue_created").
    pub event_type: String,

    /// Upstream object id, when the payload carries one.
    pub external_id: Option<String>,

    /// The raw webhook payload as received.
    pub payload: serde_json::Value,

    /// Current position in the processing state machine.
    pub status: ProcessingStatus,

    /// Number of failed attempts recorded so far.
    pub retry_count: u32,

    /// Message of the most recent failure, cleared on success.
    pub error_message: Option<String>,

    /// Populated only when `status` is `DeadLetter`.
    pub dead_letter: Option<DeadLetterRecord>,

    /// When the event was enqueued. Leasing is oldest-first on this field.
    pub received_at: DateTime<Utc>,

    /// Earliest instant a `Retrying` event may be leased again.
    /// `None` means immediately eligible.
    pub not_before: Option<DateTime<Utc>>,
}

impl SyncEvent {
    /// Returns true if the event may be leased at `now`.
    pub fn is_leasable_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leasable() && self.not_before.is_none_or(|t| t <= now)
    }
}
