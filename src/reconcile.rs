//! Log reconciliation: merges historical snapshots into streamed text.
//!
//! Two independently-timed readers observe the same server-side log buffer:
//! the historical fetch returns the whole buffer as of some instant, the push
//! stream appends chunks as they are produced. Neither carries a sequence
//! number, so the merge rule is purely length based:
//!
//! ```text
//! increment  → known = known + chunk          (always accepted)
//! snapshot   → known = snapshot  iff  len(snapshot) > len(known)
//! ```
//!
//! ## Precondition
//!
//! The server buffer is append-only and both readers return prefix-consistent
//! views of it. "Longer wins" is only correct under that contract; a server
//! that truncates or rewrites a log would make this merge silently keep the
//! wrong text.

use tracing::trace;

/// Result of offering a historical snapshot to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The snapshot was longer than the known text and replaced it.
    Applied { previous_len: usize, new_len: usize },
    /// The snapshot was equal or shorter and was dropped.
    Discarded { known_len: usize, snapshot_len: usize },
}

impl SnapshotOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// The reconciled log text for one execution.
///
/// This is the only writer of the text the terminal view renders. Its length
/// never decreases.
#[derive(Debug, Clone, Default)]
pub struct LogReconciler {
    known: String,
}

impl LogReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current best-known log text.
    pub fn text(&self) -> &str {
        &self.known
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Append a chunk delivered by the push stream.
    ///
    /// The stream is assumed ordered and non-redelivering; duplicate
    /// delivery is the transport's problem, not something this can detect.
    pub fn apply_increment(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.known.push_str(chunk);
        trace!(chunk_len = chunk.len(), known_len = self.known.len(), "applied stream increment");
    }

    /// Offer a historical snapshot. Replaces the known text only when the
    /// snapshot is strictly longer.
    pub fn apply_historical(&mut self, snapshot: &str) -> SnapshotOutcome {
        let known_len = self.known.len();
        let snapshot_len = snapshot.len();
        if snapshot_len > known_len {
            self.known.clear();
            self.known.push_str(snapshot);
            SnapshotOutcome::Applied {
                previous_len: known_len,
                new_len: snapshot_len,
            }
        } else {
            SnapshotOutcome::Discarded {
                known_len,
                snapshot_len,
            }
        }
    }
}
