//! Fire-and-forget pipeline counters.
//!
//! Incrementing never fails, never blocks, and is safe from any task. The
//! snapshot is surfaced on the inspection endpoint.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-local counters for the pipeline, shared via `Arc`.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    received: AtomicU64,
    succeeded: AtomicU64,
    skipped: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    applied: AtomicU64,
    apply_dead_lettered: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Webhooks accepted and enqueued.
    pub received: u64,
    /// Events that reached `COMPLETED` (including skips).
    pub succeeded: u64,
    /// Completed events whose transform had nothing to publish.
    pub skipped: u64,
    /// Failures that re-entered the retry queue.
    pub retried: u64,
    /// Events dead-lettered on the producer side.
    pub dead_lettered: u64,
    /// Messages applied to the graph (including idempotent replays).
    pub applied: u64,
    /// Messages dead-lettered on the consumer side.
    pub apply_dead_lettered: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied(&self) {
        self.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_apply_dead_lettered(&self) {
        self.apply_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a copy of the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            apply_dead_lettered: self.apply_dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let snapshot = PipelineMetrics::new().snapshot();
        assert_eq!(snapshot.received, 0);
        assert_eq!(snapshot.succeeded, 0);
        assert_eq!(snapshot.dead_lettered, 0);
    }

    #[test]
    fn increments_are_visible_in_snapshot() {
        let metrics = PipelineMetrics::new();
        metrics.record_received();
        metrics.record_received();
        metrics.record_succeeded();
        metrics.record_skipped();
        metrics.record_retried();
        metrics.record_dead_lettered();
        metrics.record_applied();
        metrics.record_apply_dead_lettered();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.succeeded, 1);
        assert_eq!(snapshot.skipped, 1);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.applied, 1);
        assert_eq!(snapshot.apply_dead_lettered, 1);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        use std::sync::Arc;

        let metrics = Arc::new(PipelineMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_received();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.snapshot().received, 8000);
    }
}
