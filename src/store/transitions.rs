//! The retry/dead-letter transition rule.
//!
//! Pure decision logic, separated from the store so it can be tested as a
//! function of its inputs. The store applies the returned transition under
//! its own lock.

/// Outcome of recording a processing failure for a leased event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureTransition {
    /// Budget remains: the event becomes `Retrying` with the new count.
    Retrying {
        /// The incremented retry count to persist.
        retry_count: u32,
    },

    /// Budget exhausted: the event becomes `DeadLetter`.
    DeadLetter {
        /// Total attempts, including the one that just failed.
        attempts: u32,
    },
}

/// Decides what a failure does to an event with `retry_count` prior failures
/// under a configuration allowing `retry_limit` retries.
///
/// The attempt being recorded is attempt `retry_count + 1`. It dead-letters
/// when that exceeds the limit, otherwise the event re-enters the retry
/// queue.
pub fn plan_failure(retry_count: u32, retry_limit: u32) -> FailureTransition {
    let attempts = retry_count.saturating_add(1);
    if attempts > retry_limit {
        FailureTransition::DeadLetter { attempts }
    } else {
        FailureTransition::Retrying {
            retry_count: attempts,
        }
    }
}
