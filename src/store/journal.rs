//! Append-only store journal with crash-safe replay.
//!
//! Every mutation of the event store is recorded as one JSON object per line.
//! The format is crash-safe because:
//! - Complete lines are always valid JSON
//! - A partial line (crash mid-write) is detected and truncated on replay
//!
//! # fsync Strategy
//!
//! - Critical records (enqueue, dead-letter): `sync_all()` immediately after
//!   the write, plus a directory fsync when the file is first created
//! - Other records: no fsync on append; the poller calls [`Journal::sync`]
//!   once per batch. Losing a tail of non-critical records on crash replays
//!   the affected events in an earlier state, which at-least-once processing
//!   tolerates.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::event::{DeadLetterRecord, SyncEvent};
use crate::types::EventId;

/// Errors that can occur during journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    /// IO error during file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for journal operations.
pub type Result<T> = std::result::Result<T, JournalError>;

/// One mutation of the event store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalRecord {
    /// A new event entered the store as `Pending`.
    Enqueued { event: SyncEvent },

    /// The event was leased for exclusive processing.
    Leased { id: EventId },

    /// Processing succeeded; the event is terminal `Completed`.
    Completed { id: EventId },

    /// Processing failed with budget remaining.
    Retrying {
        id: EventId,
        retry_count: u32,
        error: String,
        not_before: Option<DateTime<Utc>>,
    },

    /// Processing failed past the retry limit; terminal.
    DeadLettered {
        id: EventId,
        record: DeadLetterRecord,
    },

    /// A lease was released without an outcome (shutdown mid-batch).
    Released { id: EventId },
}

impl JournalRecord {
    /// Records that must be on disk before the operation is acknowledged.
    ///
    /// Enqueue backs the 2xx returned to the webhook caller; dead-letters
    /// must survive because nothing will ever regenerate them.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            JournalRecord::Enqueued { .. } | JournalRecord::DeadLettered { .. }
        )
    }
}

/// A journal entry as written to disk: the record plus ordering metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonically increasing sequence number.
    pub seq: u64,

    /// Wall-clock time the entry was appended.
    pub ts: DateTime<Utc>,

    /// The store mutation.
    #[serde(flatten)]
    pub record: JournalRecord,
}

/// An append-only journal of store mutations.
pub struct Journal {
    file: File,
    path: PathBuf,
    next_seq: u64,
}

impl Journal {
    /// Opens the journal at `path`, creating it (and its parent directory)
    /// if needed, and replays any existing entries.
    ///
    /// Returns the journal positioned for appending plus the replayed
    /// entries in order.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if let Some(parent) = &parent {
            std::fs::create_dir_all(parent)?;
        }

        let entries = Self::replay(&path)?;
        let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(0);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        // Make the newly created file's directory entry durable.
        if let Some(parent) = &parent {
            fsync_dir(parent)?;
        }

        Ok((
            Journal {
                file,
                path,
                next_seq,
            },
            entries,
        ))
    }

    /// Appends a record, fsyncing immediately when it is critical.
    pub fn append(&mut self, record: JournalRecord) -> Result<()> {
        let critical = record.is_critical();
        let entry = JournalEntry {
            seq: self.next_seq,
            ts: Utc::now(),
            record,
        };

        let json = serde_json::to_string(&entry)?;
        writeln!(self.file, "{}", json)?;

        if critical {
            self.file.sync_all()?;
        }

        self.next_seq += 1;
        Ok(())
    }

    /// Forces fsync of the journal file.
    ///
    /// Call after a batch of non-critical appends.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    /// Returns the path to the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads all valid entries, truncating a partial trailing line.
    ///
    /// If a line fails to parse or breaks sequence monotonicity, the file is
    /// truncated at the start of that line so the journal always contains a
    /// valid prefix.
    fn replay(path: &Path) -> Result<Vec<JournalEntry>> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut entries = Vec::new();
        let mut valid_len: u64 = 0;
        let mut max_seq: Option<u64> = None;
        let mut corrupt = false;

        loop {
            let mut line = String::new();
            let bytes_read = reader.read_line(&mut line)?;
            if bytes_read == 0 {
                break;
            }

            // A line without a trailing newline is a partial write.
            let complete = line.ends_with('\n');

            let trimmed = line.trim();
            if trimmed.is_empty() {
                if complete {
                    valid_len += bytes_read as u64;
                    continue;
                }
                break;
            }

            match serde_json::from_str::<JournalEntry>(trimmed) {
                Ok(entry) if complete => {
                    // Sequence numbers must strictly increase.
                    if max_seq.is_some_and(|prev| entry.seq <= prev) {
                        corrupt = true;
                        break;
                    }
                    max_seq = Some(entry.seq);
                    valid_len += bytes_read as u64;
                    entries.push(entry);
                }
                _ => {
                    corrupt = true;
                    break;
                }
            }
        }

        drop(reader);

        if corrupt || valid_len < std::fs::metadata(path)?.len() {
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        Ok(entries)
    }
}

/// Syncs a directory to disk, ensuring directory entries are durable.
///
/// On POSIX systems, creating or renaming a file updates the directory
/// entry; without an fsync on the directory that entry may not survive a
/// power loss even if the file contents were synced.
fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    let dir = OpenOptions::new().read(true).open(dir_path)?;
    dir.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::event::ProcessingStatus;
    use crate::types::{ConfigId, TenantId};
    use tempfile::tempdir;

    fn sample_event(id: &str) -> SyncEvent {
        SyncEvent {
            id: EventId::new(id),
            config_id: ConfigId::new("cfg-1"),
            tenant_id: TenantId::new("tenant-1"),
            source: "jira".to_string(),
            event_type: "issue_created".to_string(),
            external_id: Some("JIRA-1".to_string()),
            payload: serde_json::json!({"webhookEvent": "issue_created"}),
            status: ProcessingStatus::Pending,
            retry_count: 0,
            error_message: None,
            dead_letter: None,
            received_at: Utc::now(),
            not_before: None,
        }
    }

    #[test]
    fn open_empty_journal() {
        let dir = tempdir().unwrap();
        let (journal, entries) = Journal::open(dir.path().join("store.log")).unwrap();

        assert!(entries.is_empty());
        assert_eq!(journal.next_seq, 0);
    }

    #[test]
    fn append_and_replay_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal
                .append(JournalRecord::Enqueued {
                    event: sample_event("e1"),
                })
                .unwrap();
            journal
                .append(JournalRecord::Leased {
                    id: EventId::new("e1"),
                })
                .unwrap();
            journal
                .append(JournalRecord::Completed {
                    id: EventId::new("e1"),
                })
                .unwrap();
            journal.sync().unwrap();
        }

        let (journal, entries) = Journal::open(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(journal.next_seq, 3);
        assert!(matches!(entries[0].record, JournalRecord::Enqueued { .. }));
        assert!(matches!(entries[1].record, JournalRecord::Leased { .. }));
        assert!(matches!(entries[2].record, JournalRecord::Completed { .. }));
    }

    #[test]
    fn sequence_numbers_increase() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        let (mut journal, _) = Journal::open(&path).unwrap();
        for i in 0..5 {
            journal
                .append(JournalRecord::Leased {
                    id: EventId::new(format!("e{}", i)),
                })
                .unwrap();
        }
        journal.sync().unwrap();
        drop(journal);

        let (_, entries) = Journal::open(&path).unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn partial_trailing_line_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal
                .append(JournalRecord::Enqueued {
                    event: sample_event("e1"),
                })
                .unwrap();
            journal.sync().unwrap();
        }

        // Simulate a crash mid-write: append half a JSON object.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            write!(file, "{{\"seq\":1,\"ts\":\"2024-01-").unwrap();
        }

        let (journal, entries) = Journal::open(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(journal.next_seq, 1);

        // The partial line is gone from the file.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn garbage_line_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal
                .append(JournalRecord::Enqueued {
                    event: sample_event("e1"),
                })
                .unwrap();
            journal.sync().unwrap();
        }

        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "this is not json").unwrap();
        }

        let (_, entries) = Journal::open(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn appends_resume_after_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.log");

        {
            let (mut journal, _) = Journal::open(&path).unwrap();
            journal
                .append(JournalRecord::Enqueued {
                    event: sample_event("e1"),
                })
                .unwrap();
        }

        {
            let (mut journal, entries) = Journal::open(&path).unwrap();
            assert_eq!(entries.len(), 1);
            journal
                .append(JournalRecord::Completed {
                    id: EventId::new("e1"),
                })
                .unwrap();
            journal.sync().unwrap();
        }

        let (_, entries) = Journal::open(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].seq, 1);
    }

    #[test]
    fn critical_records_identified() {
        assert!(
            JournalRecord::Enqueued {
                event: sample_event("e1")
            }
            .is_critical()
        );
        assert!(
            JournalRecord::DeadLettered {
                id: EventId::new("e1"),
                record: DeadLetterRecord {
                    payload: serde_json::Value::Null,
                    error: "boom".to_string(),
                    failed_at: Utc::now(),
                    attempts: 4,
                },
            }
            .is_critical()
        );
        assert!(
            !JournalRecord::Leased {
                id: EventId::new("e1")
            }
            .is_critical()
        );
    }
}
