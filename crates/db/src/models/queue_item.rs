//! Queue item rows and DTOs.

use packline_core::queue::{ItemStatus, StatusId};
use packline_core::types::{from_millis, DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `queue_items` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QueueItem {
    pub id: DbId,
    pub source_path: String,
    pub camera_id: String,
    pub mtime_ms: i64,
    pub fingerprint: Option<String>,
    pub recorded_at_ms: i64,
    pub duration_ms: Option<i64>,
    pub discovered_at_ms: i64,
    pub status_id: StatusId,
    pub claimed_by: Option<String>,
    pub claimed_at_ms: Option<i64>,
    /// Incremented on every claim; part of the claim token.
    pub attempt: i64,
    pub retry_count: i64,
    pub progress_percent: Option<i64>,
    pub error_message: Option<String>,
    /// Position in completion order, set when the item reaches `done`.
    pub completed_seq: Option<i64>,
    pub completed_at_ms: Option<i64>,
}

impl QueueItem {
    pub fn status(&self) -> Option<ItemStatus> {
        ItemStatus::from_id(self.status_id)
    }

    pub fn claimed_at(&self) -> Option<Timestamp> {
        self.claimed_at_ms.map(from_millis)
    }

    /// The claim currently held on this item, if it is `processing`.
    pub fn claim(&self) -> Option<ClaimToken> {
        if self.status() != Some(ItemStatus::Processing) {
            return None;
        }
        self.claimed_by.as_ref().map(|worker| ClaimToken {
            item_id: self.id,
            attempt: self.attempt,
            worker: worker.clone(),
        })
    }
}

/// Identifies one claim: a specific worker's specific attempt on an item.
///
/// Every write made on behalf of a claim is conditional on the token still
/// matching the row, so a reclaimed worker can no longer touch the item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimToken {
    pub item_id: DbId,
    pub attempt: i64,
    pub worker: String,
}

/// DTO for enqueuing a discovered file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewQueueItem {
    /// Canonical absolute path.
    pub source_path: String,
    pub camera_id: String,
    pub mtime_ms: i64,
    pub fingerprint: Option<String>,
    pub recorded_at_ms: i64,
    pub duration_ms: Option<i64>,
}

/// Per-status item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
}

impl StatusCounts {
    /// Items not yet finished: `pending + processing`.
    pub fn depth(&self) -> i64 {
        self.pending + self.processing
    }
}

/// An item whose claim was revoked by the stale-job sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReclaimedItem {
    pub item_id: DbId,
    pub source_path: String,
    /// The worker whose claim was revoked.
    pub claimed_by: Option<String>,
    pub claimed_at_ms: Option<i64>,
    pub retry_count: i64,
    /// `Retrying` when the item went back to `pending`, `Failed` when the
    /// retry budget was already spent.
    pub outcome: FailOutcome,
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailOutcome {
    /// Returned to `pending` for another attempt.
    Retrying,
    /// Moved to `failed`.
    Failed,
    /// The claim was no longer held; nothing changed.
    ClaimLost,
}
