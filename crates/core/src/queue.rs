//! Queue item statuses and the retry policy.
//!
//! `pending -> processing -> done | failed`, with `processing -> pending`
//! for a retryable failure or a stale reclaim. `done` and `failed` are
//! terminal.

use serde::{Deserialize, Serialize};

/// Status ID type matching the INTEGER `status_id` column.
pub type StatusId = i64;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a queue item.
///
/// Discriminants are the persisted `status_id` values and must never be
/// renumbered.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending = 1,
    Processing = 2,
    Done = 3,
    Failed = 4,
}

impl ItemStatus {
    /// Return the persisted status ID.
    pub fn id(self) -> StatusId {
        self as StatusId
    }

    /// Map a persisted status ID back to a status.
    pub fn from_id(id: StatusId) -> Option<Self> {
        match id {
            1 => Some(Self::Pending),
            2 => Some(Self::Processing),
            3 => Some(Self::Done),
            4 => Some(Self::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// How a processing attempt ended unsuccessfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Corrupt or unsupported media. Never retried.
    Corrupt,
    /// Detector exception or crash. Retried while budget remains.
    Transient,
}

/// Decide the status an item moves to after a failed attempt.
///
/// `retry_count` is the number of retries already spent.
pub fn status_after_failure(kind: FailureKind, retry_count: i64, max_retries: i64) -> ItemStatus {
    match kind {
        FailureKind::Corrupt => ItemStatus::Failed,
        FailureKind::Transient if retry_count < max_retries => ItemStatus::Pending,
        FailureKind::Transient => ItemStatus::Failed,
    }
}
