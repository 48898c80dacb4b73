//! Repository for the `packing_events` table.

use packline_core::types::DbId;

use crate::models::packing_event::{NewPackingEvent, PackingEvent};
use crate::repositories::pipeline_state_repo::{PipelineStateRepo, SYNTH_CHECKPOINT};
use crate::DbPool;

/// Column list for `packing_events` queries.
const COLUMNS: &str = "\
    id, item_id, camera_id, started_at_ms, ended_at_ms, \
    detection_count, metadata, created_at_ms";

pub struct PackingEventRepo;

impl PackingEventRepo {
    /// Persist synthesized events and advance the synthesizer checkpoint
    /// in one transaction.
    ///
    /// Events already stored for the same `(item_id, started_at_ms)` are
    /// skipped. Returns the number of new rows.
    pub async fn insert_with_checkpoint(
        pool: &DbPool,
        events: &[NewPackingEvent],
        checkpoint: i64,
        now_ms: i64,
    ) -> Result<u64, sqlx::Error> {
        let mut tx = pool.begin().await?;
        let mut inserted = 0;
        for event in events {
            let result = sqlx::query(
                "INSERT INTO packing_events \
                     (item_id, camera_id, started_at_ms, ended_at_ms, detection_count, \
                      metadata, created_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT (item_id, started_at_ms) DO NOTHING",
            )
            .bind(event.item_id)
            .bind(&event.camera_id)
            .bind(event.started_at_ms)
            .bind(event.ended_at_ms)
            .bind(event.detection_count)
            .bind(event.metadata.to_string())
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        PipelineStateRepo::set(&mut *tx, SYNTH_CHECKPOINT, checkpoint).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn list_for_item(pool: &DbPool, item_id: DbId) -> Result<Vec<PackingEvent>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM packing_events WHERE item_id = ?1 ORDER BY started_at_ms ASC"
        );
        sqlx::query_as::<_, PackingEvent>(&query)
            .bind(item_id)
            .fetch_all(pool)
            .await
    }

    /// Events for one camera whose start falls in `[from_ms, until_ms)`.
    pub async fn list_by_camera(
        pool: &DbPool,
        camera_id: &str,
        from_ms: i64,
        until_ms: i64,
    ) -> Result<Vec<PackingEvent>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM packing_events \
             WHERE camera_id = ?1 AND started_at_ms >= ?2 AND started_at_ms < ?3 \
             ORDER BY started_at_ms ASC, item_id ASC"
        );
        sqlx::query_as::<_, PackingEvent>(&query)
            .bind(camera_id)
            .bind(from_ms)
            .bind(until_ms)
            .fetch_all(pool)
            .await
    }

    pub async fn list_all(pool: &DbPool) -> Result<Vec<PackingEvent>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM packing_events ORDER BY item_id ASC, started_at_ms ASC"
        );
        sqlx::query_as::<_, PackingEvent>(&query).fetch_all(pool).await
    }
}
