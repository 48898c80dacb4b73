//! Repository for the `pipeline_state` key/value table.

use sqlx::{Executor, Sqlite};

/// Key under which the synthesizer stores the last consumed `completed_seq`.
pub const SYNTH_CHECKPOINT: &str = "synth_checkpoint";

/// Key under which the discoverer stores the start of its last completed scan.
pub const LAST_SCAN_AT: &str = "last_scan_at_ms";

/// Integer-valued scheduler bookmarks.
pub struct PipelineStateRepo;

impl PipelineStateRepo {
    pub async fn get<'e, E>(executor: E, key: &str) -> Result<Option<i64>, sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query_scalar("SELECT value FROM pipeline_state WHERE key = ?1")
            .bind(key)
            .fetch_optional(executor)
            .await
    }

    /// Insert or overwrite a value.
    pub async fn set<'e, E>(executor: E, key: &str, value: i64) -> Result<(), sqlx::Error>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            "INSERT INTO pipeline_state (key, value) VALUES (?1, ?2) \
             ON CONFLICT (key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(executor)
        .await?;
        Ok(())
    }
}
