//! Lock-disciplined access to the scheduler's shared tables.
//!
//! All pipeline actors go through one [`Store`]. It owns the process-wide
//! reader-writer lock: read-only queries share it, and every claim,
//! transition or insert holds it exclusively for exactly one statement or
//! one short transaction. Detector I/O never happens under the lock.
//!
//! Contention is retried here with exponential backoff and never reaches
//! callers unless the retry budget runs out. Loss of the database flips
//! the store into a degraded state, reported by [`Store::health`], until
//! the next successful operation.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use packline_core::backoff::{next_delay, BackoffConfig};
use packline_core::detector::DetectionRecord;
use packline_core::queue::{FailureKind, ItemStatus};
use packline_core::types::{now_millis, DbId};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::models::packing_event::{NewPackingEvent, PackingEvent};
use crate::models::queue_item::{
    ClaimToken, FailOutcome, NewQueueItem, QueueItem, ReclaimedItem, StatusCounts,
};
use crate::repositories::pipeline_state_repo::{LAST_SCAN_AT, SYNTH_CHECKPOINT};
use crate::repositories::{DetectionLogRepo, PackingEventRepo, PipelineStateRepo, QueueItemRepo};
use crate::DbPool;

/// Reachability of the database as last observed by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreHealth {
    pub degraded: bool,
    pub last_error: Option<String>,
    /// When the current degraded period began.
    pub degraded_since_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Shared,
    Exclusive,
}

pub struct Store {
    pool: DbPool,
    lock: RwLock<()>,
    retry: BackoffConfig,
    degraded: AtomicBool,
    health: Mutex<StoreHealth>,
}

impl Store {
    pub fn new(pool: DbPool) -> Self {
        Self::with_retry(pool, BackoffConfig::default())
    }

    pub fn with_retry(pool: DbPool, retry: BackoffConfig) -> Self {
        Self {
            pool,
            lock: RwLock::new(()),
            retry,
            degraded: AtomicBool::new(false),
            health: Mutex::new(StoreHealth::default()),
        }
    }

    /// Open a file-backed store and bring its schema up to date.
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let pool = crate::create_pool(database_url).await?;
        crate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Open a migrated in-memory store.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = crate::create_memory_pool().await?;
        crate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn health(&self) -> StoreHealth {
        self.health
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Round-trip to the database; clears the degraded state on success.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "ping", move || crate::health_check(pool))
            .await
    }

    /// Close the pool. Subsequent operations report the store unavailable.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    /// Enqueue discovered files as `pending`. Returns the number inserted.
    pub async fn enqueue(&self, items: &[NewQueueItem]) -> Result<u64, StoreError> {
        let pool = &self.pool;
        let now = now_millis();
        self.run(Access::Exclusive, "enqueue", move || {
            QueueItemRepo::insert_batch(pool, items, now)
        })
        .await
    }

    pub async fn is_known(&self, source_path: &str, mtime_ms: i64) -> Result<bool, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "is_known", move || {
            QueueItemRepo::exists(pool, source_path, mtime_ms)
        })
        .await
    }

    pub async fn is_fingerprint_known(&self, fingerprint: &str) -> Result<bool, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "is_fingerprint_known", move || {
            QueueItemRepo::fingerprint_exists(pool, fingerprint)
        })
        .await
    }

    /// Claim the oldest pending item for `worker`.
    pub async fn claim_next(&self, worker: &str) -> Result<Option<QueueItem>, StoreError> {
        let pool = &self.pool;
        self.run(Access::Exclusive, "claim_next", move || {
            QueueItemRepo::claim_next(pool, worker, now_millis())
        })
        .await
    }

    pub async fn is_claim_held(&self, token: &ClaimToken) -> Result<bool, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "is_claim_held", move || {
            QueueItemRepo::is_claim_held(pool, token)
        })
        .await
    }

    /// Append detection logs for a held claim. `false` means the claim was lost.
    pub async fn append_logs(
        &self,
        token: &ClaimToken,
        records: &[DetectionRecord],
        progress_percent: Option<i64>,
    ) -> Result<bool, StoreError> {
        let pool = &self.pool;
        self.run(Access::Exclusive, "append_logs", move || {
            DetectionLogRepo::append_if_claimed(pool, token, records, progress_percent, now_millis())
        })
        .await
    }

    /// Mark a held item `done`. `false` means the claim was lost.
    pub async fn complete(&self, token: &ClaimToken) -> Result<bool, StoreError> {
        let pool = &self.pool;
        self.run(Access::Exclusive, "complete", move || {
            QueueItemRepo::complete(pool, token, now_millis())
        })
        .await
    }

    pub async fn fail(
        &self,
        token: &ClaimToken,
        kind: FailureKind,
        error: &str,
        max_retries: i64,
    ) -> Result<FailOutcome, StoreError> {
        let pool = &self.pool;
        self.run(Access::Exclusive, "fail", move || {
            QueueItemRepo::fail(pool, token, kind, error, max_retries)
        })
        .await
    }

    /// Revoke `processing` claims taken before `cutoff_ms`, returning each
    /// item to `pending` or, with its retries spent, to `failed`.
    pub async fn reclaim_stale(
        &self,
        cutoff_ms: i64,
        max_retries: i64,
    ) -> Result<Vec<ReclaimedItem>, StoreError> {
        let pool = &self.pool;
        self.run(Access::Exclusive, "reclaim_stale", move || {
            QueueItemRepo::reclaim_stale(pool, cutoff_ms, max_retries)
        })
        .await
    }

    pub async fn counts(&self) -> Result<StatusCounts, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "counts", move || QueueItemRepo::counts(pool))
            .await
    }

    /// `done` items not yet consumed by the synthesizer.
    pub async fn synthesis_lag(&self) -> Result<i64, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "synthesis_lag", move || {
            QueueItemRepo::synthesis_lag(pool)
        })
        .await
    }

    pub async fn items_in_status(&self, status: ItemStatus) -> Result<Vec<QueueItem>, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "items_in_status", move || {
            QueueItemRepo::list_by_status(pool, status)
        })
        .await
    }

    pub async fn find_item(&self, id: DbId) -> Result<Option<QueueItem>, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "find_item", move || {
            QueueItemRepo::find_by_id(pool, id)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Synthesis
    // -----------------------------------------------------------------------

    /// Items completed after `after_seq`, in completion order.
    pub async fn completed_since(
        &self,
        after_seq: i64,
        limit: i64,
    ) -> Result<Vec<QueueItem>, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "completed_since", move || {
            QueueItemRepo::done_since(pool, after_seq, limit)
        })
        .await
    }

    /// Decoded detection records written by one claim attempt.
    pub async fn detections(
        &self,
        item_id: DbId,
        attempt: i64,
    ) -> Result<Vec<DetectionRecord>, StoreError> {
        let pool = &self.pool;
        let logs = self
            .run(Access::Shared, "detections", move || {
                DetectionLogRepo::list_for_attempt(pool, item_id, attempt)
            })
            .await?;
        logs.iter()
            .map(|log| {
                log.record().map_err(|e| {
                    StoreError::Corrupt(format!("detection log {} payload: {e}", log.id))
                })
            })
            .collect()
    }

    /// Persist events and advance the synthesizer checkpoint atomically.
    pub async fn record_events(
        &self,
        events: &[NewPackingEvent],
        checkpoint: i64,
    ) -> Result<u64, StoreError> {
        let pool = &self.pool;
        let now = now_millis();
        self.run(Access::Exclusive, "record_events", move || {
            PackingEventRepo::insert_with_checkpoint(pool, events, checkpoint, now)
        })
        .await
    }

    pub async fn events_for_item(&self, item_id: DbId) -> Result<Vec<PackingEvent>, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "events_for_item", move || {
            PackingEventRepo::list_for_item(pool, item_id)
        })
        .await
    }

    /// Events for one camera starting in `[from_ms, until_ms)`.
    pub async fn events_for_camera(
        &self,
        camera_id: &str,
        from_ms: i64,
        until_ms: i64,
    ) -> Result<Vec<PackingEvent>, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "events_for_camera", move || {
            PackingEventRepo::list_by_camera(pool, camera_id, from_ms, until_ms)
        })
        .await
    }

    pub async fn all_events(&self) -> Result<Vec<PackingEvent>, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "all_events", move || {
            PackingEventRepo::list_all(pool)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Bookmarks
    // -----------------------------------------------------------------------

    /// Last `completed_seq` consumed by the synthesizer (0 before the first pass).
    pub async fn synth_checkpoint(&self) -> Result<i64, StoreError> {
        let pool = &self.pool;
        let value = self
            .run(Access::Shared, "synth_checkpoint", move || {
                PipelineStateRepo::get(pool, SYNTH_CHECKPOINT)
            })
            .await?;
        Ok(value.unwrap_or(0))
    }

    pub async fn last_scan_at(&self) -> Result<Option<i64>, StoreError> {
        let pool = &self.pool;
        self.run(Access::Shared, "last_scan_at", move || {
            PipelineStateRepo::get(pool, LAST_SCAN_AT)
        })
        .await
    }

    pub async fn set_last_scan_at(&self, at_ms: i64) -> Result<(), StoreError> {
        let pool = &self.pool;
        self.run(Access::Exclusive, "set_last_scan_at", move || {
            PipelineStateRepo::set(pool, LAST_SCAN_AT, at_ms)
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Lock + retry
    // -----------------------------------------------------------------------

    async fn run<T, F, Fut>(&self, access: Access, op: &'static str, mut f: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt: u32 = 0;
        let mut delay = self.retry.initial_delay;
        loop {
            // The guard is released before any backoff sleep.
            let result = match access {
                Access::Shared => {
                    let _guard = self.lock.read().await;
                    f().await
                }
                Access::Exclusive => {
                    let _guard = self.lock.write().await;
                    f().await
                }
            };

            match result.map_err(StoreError::from) {
                Ok(value) => {
                    self.mark_healthy();
                    return Ok(value);
                }
                Err(err) if err.is_contention() && self.retry.allows(attempt + 1) => {
                    attempt += 1;
                    tracing::debug!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Store contention, retrying",
                    );
                    tokio::time::sleep(delay).await;
                    delay = next_delay(delay, &self.retry);
                }
                Err(err) => {
                    if err.is_unavailable() {
                        self.mark_degraded(op, &err);
                    }
                    return Err(err);
                }
            }
        }
    }

    fn mark_healthy(&self) {
        if self.degraded.swap(false, Ordering::AcqRel) {
            let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
            tracing::info!(
                degraded_since_ms = health.degraded_since_ms,
                "Store reachable again, leaving degraded mode",
            );
            *health = StoreHealth::default();
        }
    }

    fn mark_degraded(&self, op: &'static str, err: &StoreError) {
        let mut health = self.health.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.degraded.swap(true, Ordering::AcqRel) {
            tracing::error!(op, error = %err, "Store unavailable, entering degraded mode");
            health.degraded_since_ms = Some(now_millis());
        }
        health.degraded = true;
        health.last_error = Some(err.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(path: &str, mtime_ms: i64) -> NewQueueItem {
        NewQueueItem {
            source_path: path.to_string(),
            camera_id: "cam".to_string(),
            mtime_ms,
            fingerprint: None,
            recorded_at_ms: mtime_ms,
            duration_ms: Some(10_000),
        }
    }

    #[tokio::test]
    async fn fresh_store_is_healthy_and_empty() {
        let store = Store::open_in_memory().await.unwrap();
        store.ping().await.unwrap();
        assert_eq!(store.health(), StoreHealth::default());
        assert_eq!(store.counts().await.unwrap(), StatusCounts::default());
        assert_eq!(store.synth_checkpoint().await.unwrap(), 0);
        assert_eq!(store.last_scan_at().await.unwrap(), None);
    }

    #[tokio::test]
    async fn closed_pool_reports_degraded() {
        let store = Store::open_in_memory().await.unwrap();
        store.close().await;

        let err = store.counts().await.unwrap_err();
        assert!(err.is_unavailable(), "got {err:?}");
        let health = store.health();
        assert!(health.degraded);
        assert!(health.last_error.is_some());
        assert!(health.degraded_since_ms.is_some());
    }

    #[tokio::test]
    async fn claim_complete_updates_counts() {
        let store = Store::open_in_memory().await.unwrap();
        store.enqueue(&[item("/a.mp4", 1), item("/b.mp4", 2)]).await.unwrap();

        let claimed = store.claim_next("w1").await.unwrap().unwrap();
        assert_eq!(claimed.source_path, "/a.mp4");
        let token = claimed.claim().unwrap();
        assert!(store.complete(&token).await.unwrap());

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.done, 1);
        assert_eq!(store.synthesis_lag().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scan_watermark_persists() {
        let store = Store::open_in_memory().await.unwrap();
        let now = now_millis();
        store.set_last_scan_at(now).await.unwrap();
        assert_eq!(store.last_scan_at().await.unwrap(), Some(now));
    }
}
