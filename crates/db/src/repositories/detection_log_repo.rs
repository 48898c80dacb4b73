//! Repository for the append-only `detection_logs` table.

use packline_core::detector::DetectionRecord;
use packline_core::queue::ItemStatus;
use packline_core::types::DbId;

use crate::models::detection_log::DetectionLog;
use crate::models::queue_item::ClaimToken;
use crate::DbPool;

/// Column list for `detection_logs` queries.
const COLUMNS: &str = "id, item_id, attempt, offset_ms, payload, written_by, written_at_ms";

pub struct DetectionLogRepo;

impl DetectionLogRepo {
    /// Append a batch of records for a held claim and update the item's
    /// progress, in one transaction.
    ///
    /// Returns `false` (writing nothing) when the claim is no longer held.
    pub async fn append_if_claimed(
        pool: &DbPool,
        token: &ClaimToken,
        records: &[DetectionRecord],
        progress_percent: Option<i64>,
        now_ms: i64,
    ) -> Result<bool, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let held: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM queue_items \
             WHERE id = ?1 AND status_id = ?2 AND attempt = ?3 AND claimed_by = ?4)",
        )
        .bind(token.item_id)
        .bind(ItemStatus::Processing.id())
        .bind(token.attempt)
        .bind(&token.worker)
        .fetch_one(&mut *tx)
        .await?;
        if !held {
            return Ok(false);
        }

        for record in records {
            sqlx::query(
                "INSERT INTO detection_logs \
                     (item_id, attempt, offset_ms, payload, written_by, written_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(token.item_id)
            .bind(token.attempt)
            .bind(record.offset_ms)
            .bind(record.payload.to_string())
            .bind(&token.worker)
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(percent) = progress_percent {
            sqlx::query("UPDATE queue_items SET progress_percent = ?2 WHERE id = ?1")
                .bind(token.item_id)
                .bind(percent)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Logs written by one claim attempt, in offset order.
    pub async fn list_for_attempt(
        pool: &DbPool,
        item_id: DbId,
        attempt: i64,
    ) -> Result<Vec<DetectionLog>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM detection_logs \
             WHERE item_id = ?1 AND attempt = ?2 \
             ORDER BY offset_ms ASC, id ASC"
        );
        sqlx::query_as::<_, DetectionLog>(&query)
            .bind(item_id)
            .bind(attempt)
            .fetch_all(pool)
            .await
    }
}
