//! Repository for the `queue_items` table.
//!
//! Every transition is a compare-and-swap on `status_id`; transitions made
//! on behalf of a worker additionally match its [`ClaimToken`], so a claim
//! revoked by the reclaimer can never be completed or failed late.

use packline_core::queue::{status_after_failure, FailureKind, ItemStatus, StatusId};
use packline_core::types::DbId;

use crate::models::queue_item::{
    ClaimToken, FailOutcome, NewQueueItem, QueueItem, ReclaimedItem, StatusCounts,
};
use crate::repositories::pipeline_state_repo::SYNTH_CHECKPOINT;
use crate::DbPool;

/// Column list for `queue_items` queries.
const COLUMNS: &str = "\
    id, source_path, camera_id, mtime_ms, fingerprint, \
    recorded_at_ms, duration_ms, discovered_at_ms, \
    status_id, claimed_by, claimed_at_ms, attempt, retry_count, \
    progress_percent, error_message, completed_seq, completed_at_ms";

/// Predicate matching a held claim; binds `?1..=?4`.
const CLAIM_HELD: &str = "id = ?1 AND status_id = ?2 AND attempt = ?3 AND claimed_by = ?4";

/// Queue operations: enqueue, claim, complete, fail, reclaim.
pub struct QueueItemRepo;

impl QueueItemRepo {
    /// Insert a batch of discovered files as `pending` in one transaction.
    ///
    /// Rows colliding with an existing `(source_path, mtime_ms)` or
    /// fingerprint are skipped. Returns the number actually inserted.
    pub async fn insert_batch(
        pool: &DbPool,
        items: &[NewQueueItem],
        discovered_at_ms: i64,
    ) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let mut inserted = 0;
        for item in items {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO queue_items \
                     (source_path, camera_id, mtime_ms, fingerprint, recorded_at_ms, \
                      duration_ms, discovered_at_ms, status_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )
            .bind(&item.source_path)
            .bind(&item.camera_id)
            .bind(item.mtime_ms)
            .bind(&item.fingerprint)
            .bind(item.recorded_at_ms)
            .bind(item.duration_ms)
            .bind(discovered_at_ms)
            .bind(ItemStatus::Pending.id())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Whether a file with this path and modification time is already queued.
    pub async fn exists(pool: &DbPool, source_path: &str, mtime_ms: i64) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM queue_items WHERE source_path = ?1 AND mtime_ms = ?2)",
        )
        .bind(source_path)
        .bind(mtime_ms)
        .fetch_one(pool)
        .await
    }

    /// Whether a file with this content fingerprint is already queued.
    pub async fn fingerprint_exists(pool: &DbPool, fingerprint: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM queue_items WHERE fingerprint = ?1)")
            .bind(fingerprint)
            .fetch_one(pool)
            .await
    }

    /// Atomically claim the oldest pending item for `worker`.
    ///
    /// Increments `attempt`, so the returned row's [`QueueItem::claim`] is a
    /// fresh token distinct from every earlier claim on the same item.
    pub async fn claim_next(
        pool: &DbPool,
        worker: &str,
        now_ms: i64,
    ) -> Result<Option<QueueItem>, sqlx::Error> {
        let query = format!(
            "UPDATE queue_items \
             SET status_id = ?1, claimed_by = ?2, claimed_at_ms = ?3, \
                 attempt = attempt + 1, progress_percent = NULL \
             WHERE id = ( \
                 SELECT id FROM queue_items \
                 WHERE status_id = ?4 \
                 ORDER BY id ASC \
                 LIMIT 1 \
             ) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, QueueItem>(&query)
            .bind(ItemStatus::Processing.id())
            .bind(worker)
            .bind(now_ms)
            .bind(ItemStatus::Pending.id())
            .fetch_optional(pool)
            .await
    }

    /// Whether `token` still holds its item.
    pub async fn is_claim_held(pool: &DbPool, token: &ClaimToken) -> Result<bool, sqlx::Error> {
        let query = format!("SELECT EXISTS (SELECT 1 FROM queue_items WHERE {CLAIM_HELD})");
        sqlx::query_scalar(&query)
            .bind(token.item_id)
            .bind(ItemStatus::Processing.id())
            .bind(token.attempt)
            .bind(&token.worker)
            .fetch_one(pool)
            .await
    }

    /// Transition a held item to `done`, assigning the next completion sequence.
    ///
    /// Returns `false` when the claim was no longer held.
    pub async fn complete(
        pool: &DbPool,
        token: &ClaimToken,
        now_ms: i64,
    ) -> Result<bool, sqlx::Error> {
        let query = format!(
            "UPDATE queue_items \
             SET status_id = ?5, completed_at_ms = ?6, progress_percent = 100, \
                 completed_seq = (SELECT COALESCE(MAX(completed_seq), 0) + 1 FROM queue_items) \
             WHERE {CLAIM_HELD}"
        );
        let result = sqlx::query(&query)
            .bind(token.item_id)
            .bind(ItemStatus::Processing.id())
            .bind(token.attempt)
            .bind(&token.worker)
            .bind(ItemStatus::Done.id())
            .bind(now_ms)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Record a failed attempt on a held item.
    ///
    /// Corrupt media fails terminally; transient failures go back to
    /// `pending` while `retry_count < max_retries`.
    pub async fn fail(
        pool: &DbPool,
        token: &ClaimToken,
        kind: FailureKind,
        error: &str,
        max_retries: i64,
    ) -> Result<FailOutcome, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let query = format!("SELECT retry_count FROM queue_items WHERE {CLAIM_HELD}");
        let retry_count: Option<i64> = sqlx::query_scalar(&query)
            .bind(token.item_id)
            .bind(ItemStatus::Processing.id())
            .bind(token.attempt)
            .bind(&token.worker)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(retry_count) = retry_count else {
            return Ok(FailOutcome::ClaimLost);
        };

        let outcome = match status_after_failure(kind, retry_count, max_retries) {
            ItemStatus::Pending => {
                sqlx::query(
                    "UPDATE queue_items \
                     SET status_id = ?2, retry_count = retry_count + 1, error_message = ?3, \
                         claimed_by = NULL, claimed_at_ms = NULL, progress_percent = NULL \
                     WHERE id = ?1",
                )
                .bind(token.item_id)
                .bind(ItemStatus::Pending.id())
                .bind(error)
                .execute(&mut *tx)
                .await?;
                FailOutcome::Retrying
            }
            _ => {
                sqlx::query(
                    "UPDATE queue_items \
                     SET status_id = ?2, error_message = ?3, progress_percent = NULL \
                     WHERE id = ?1",
                )
                .bind(token.item_id)
                .bind(ItemStatus::Failed.id())
                .bind(error)
                .execute(&mut *tx)
                .await?;
                FailOutcome::Failed
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    /// Revoke every `processing` claim taken before `cutoff_ms`.
    ///
    /// A reclaim spends one retry: the item goes back to `pending` while
    /// `retry_count < max_retries` and to `failed` once the budget is
    /// spent. Each row is updated only if its attempt is unchanged since it
    /// was selected.
    pub async fn reclaim_stale(
        pool: &DbPool,
        cutoff_ms: i64,
        max_retries: i64,
    ) -> Result<Vec<ReclaimedItem>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let stale: Vec<(DbId, String, Option<String>, Option<i64>, i64, i64)> = sqlx::query_as(
            "SELECT id, source_path, claimed_by, claimed_at_ms, attempt, retry_count \
             FROM queue_items \
             WHERE status_id = ?1 AND claimed_at_ms < ?2 \
             ORDER BY id ASC",
        )
        .bind(ItemStatus::Processing.id())
        .bind(cutoff_ms)
        .fetch_all(&mut *tx)
        .await?;

        let mut reclaimed = Vec::with_capacity(stale.len());
        for (id, source_path, claimed_by, claimed_at_ms, attempt, retry_count) in stale {
            let status = status_after_failure(FailureKind::Transient, retry_count, max_retries);
            let (query, outcome) = match status {
                ItemStatus::Pending => (
                    "UPDATE queue_items \
                     SET status_id = ?3, retry_count = retry_count + 1, \
                         claimed_by = NULL, claimed_at_ms = NULL, progress_percent = NULL, \
                         error_message = 'reclaimed: processing timeout exceeded' \
                     WHERE id = ?1 AND attempt = ?2 AND status_id = ?4 \
                     RETURNING retry_count",
                    FailOutcome::Retrying,
                ),
                _ => (
                    "UPDATE queue_items \
                     SET status_id = ?3, progress_percent = NULL, \
                         error_message = 'processing timeout exceeded, retries exhausted' \
                     WHERE id = ?1 AND attempt = ?2 AND status_id = ?4 \
                     RETURNING retry_count",
                    FailOutcome::Failed,
                ),
            };
            let retry_count: Option<i64> = sqlx::query_scalar(query)
                .bind(id)
                .bind(attempt)
                .bind(status.id())
                .bind(ItemStatus::Processing.id())
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(retry_count) = retry_count {
                reclaimed.push(ReclaimedItem {
                    item_id: id,
                    source_path,
                    claimed_by,
                    claimed_at_ms,
                    retry_count,
                    outcome,
                });
            }
        }

        tx.commit().await?;
        Ok(reclaimed)
    }

    /// Item counts per status.
    pub async fn counts(pool: &DbPool) -> Result<StatusCounts, sqlx::Error> {
        let rows: Vec<(StatusId, i64)> =
            sqlx::query_as("SELECT status_id, COUNT(*) FROM queue_items GROUP BY status_id")
                .fetch_all(pool)
                .await?;

        let mut counts = StatusCounts::default();
        for (status_id, count) in rows {
            match ItemStatus::from_id(status_id) {
                Some(ItemStatus::Pending) => counts.pending = count,
                Some(ItemStatus::Processing) => counts.processing = count,
                Some(ItemStatus::Done) => counts.done = count,
                Some(ItemStatus::Failed) => counts.failed = count,
                None => tracing::warn!(status_id, count, "Unknown queue status id"),
            }
        }
        Ok(counts)
    }

    /// Number of `done` items the synthesizer has not consumed yet.
    pub async fn synthesis_lag(pool: &DbPool) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_items \
             WHERE status_id = ?1 AND completed_seq > COALESCE( \
                 (SELECT value FROM pipeline_state WHERE key = ?2), 0)",
        )
        .bind(ItemStatus::Done.id())
        .bind(SYNTH_CHECKPOINT)
        .fetch_one(pool)
        .await
    }

    /// `done` items completed after sequence `after_seq`, in completion order.
    pub async fn done_since(
        pool: &DbPool,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<QueueItem>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM queue_items \
             WHERE status_id = ?1 AND completed_seq > ?2 \
             ORDER BY completed_seq ASC \
             LIMIT ?3"
        );
        sqlx::query_as::<_, QueueItem>(&query)
            .bind(ItemStatus::Done.id())
            .bind(after_seq)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// All items in the given status, oldest first.
    pub async fn list_by_status(
        pool: &DbPool,
        status: ItemStatus,
    ) -> Result<Vec<QueueItem>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM queue_items WHERE status_id = ?1 ORDER BY id ASC");
        sqlx::query_as::<_, QueueItem>(&query)
            .bind(status.id())
            .fetch_all(pool)
            .await
    }

    pub async fn find_by_id(pool: &DbPool, id: DbId) -> Result<Option<QueueItem>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM queue_items WHERE id = ?1");
        sqlx::query_as::<_, QueueItem>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }
}
