//! Stale-job reclaimer.
//!
//! Periodically revokes `processing` claims older than the item timeout.
//! A revoked item goes back to `pending`, or to `failed` once its retries
//! are spent, so an item that always outlives the timeout still settles.
//! The owning worker is never signalled; it discovers the revocation on its
//! next claim check or conditional write.

use std::sync::Arc;
use std::time::Duration;

use packline_core::pipeline_events::EVENT_ITEM_RECLAIMED;
use packline_core::pool::PoolConfig;
use packline_core::types::now_millis;
use packline_db::models::queue_item::{FailOutcome, ReclaimedItem};
use packline_db::{Store, StoreError};
use packline_events::{EventBus, PipelineEvent, WakeSignal};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub struct Reclaimer {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    work_ready: WakeSignal,
}

impl Reclaimer {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, work_ready: WakeSignal) -> Self {
        Self {
            store,
            bus,
            work_ready,
        }
    }

    /// One sweep: reclaim every item claimed more than `item_timeout` ago.
    pub async fn sweep(
        &self,
        item_timeout: Duration,
        max_retries: i64,
    ) -> Result<Vec<ReclaimedItem>, StoreError> {
        let timeout_ms = i64::try_from(item_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff_ms = now_millis().saturating_sub(timeout_ms);
        let reclaimed = self.store.reclaim_stale(cutoff_ms, max_retries).await?;

        for item in &reclaimed {
            tracing::warn!(
                item_id = item.item_id,
                path = %item.source_path,
                claimed_by = item.claimed_by.as_deref().unwrap_or("-"),
                retry_count = item.retry_count,
                failed = item.outcome == FailOutcome::Failed,
                "Reclaimed stale item",
            );
            let mut event = PipelineEvent::new(EVENT_ITEM_RECLAIMED)
                .with_item(item.item_id)
                .with_payload(serde_json::json!({
                    "source_path": item.source_path,
                    "claimed_at_ms": item.claimed_at_ms,
                    "retry_count": item.retry_count,
                    "outcome": item.outcome,
                }));
            if let Some(worker) = &item.claimed_by {
                event = event.with_worker(worker.as_str());
            }
            self.bus.publish(event);
        }
        if reclaimed.iter().any(|item| item.outcome == FailOutcome::Retrying) {
            self.work_ready.notify();
        }
        Ok(reclaimed)
    }

    /// Sweep every `reclaim_interval` until cancelled. Interval, timeout
    /// and retry budget are re-read from the live configuration before each
    /// sweep.
    pub async fn run(self, config: watch::Receiver<PoolConfig>, cancel: CancellationToken) {
        tracing::info!("Reclaimer started");
        loop {
            let (interval, item_timeout, max_retries) = {
                let cfg = config.borrow();
                (cfg.reclaim_interval, cfg.item_timeout, cfg.max_retries)
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.sweep(item_timeout, max_retries).await {
                tracing::error!(error = %e, "Reclaim sweep failed");
            }
        }
        tracing::info!("Reclaimer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packline_db::models::queue_item::NewQueueItem;

    #[tokio::test]
    async fn sweep_reclaims_and_signals() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store
            .enqueue(&[NewQueueItem {
                source_path: "/v/a.mp4".into(),
                camera_id: "cam".into(),
                mtime_ms: 1,
                fingerprint: None,
                recorded_at_ms: 1,
                duration_ms: None,
            }])
            .await
            .unwrap();
        store.claim_next("w1").await.unwrap().unwrap();

        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let work_ready = WakeSignal::new("work_ready");
        let mut listener = work_ready.listener();
        let reclaimer = Reclaimer::new(Arc::clone(&store), bus, work_ready);

        // A long timeout leaves the fresh claim alone.
        assert!(reclaimer.sweep(Duration::from_secs(60), 3).await.unwrap().is_empty());
        assert!(!listener.is_pending());

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = reclaimer.sweep(Duration::ZERO, 3).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].outcome, FailOutcome::Retrying);
        assert_eq!(reclaimed[0].claimed_by.as_deref(), Some("w1"));
        assert!(listener.is_pending());

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, EVENT_ITEM_RECLAIMED);
        assert_eq!(event.worker.as_deref(), Some("w1"));
        assert_eq!(store.counts().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn spent_budget_fails_instead_of_requeueing() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        store
            .enqueue(&[NewQueueItem {
                source_path: "/v/slow.mp4".into(),
                camera_id: "cam".into(),
                mtime_ms: 1,
                fingerprint: None,
                recorded_at_ms: 1,
                duration_ms: None,
            }])
            .await
            .unwrap();
        let work_ready = WakeSignal::new("work_ready");
        let mut listener = work_ready.listener();
        let bus = Arc::new(EventBus::default());
        let reclaimer = Reclaimer::new(Arc::clone(&store), bus, work_ready);

        for expected in 1..=2 {
            store.claim_next("w").await.unwrap().unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            let reclaimed = reclaimer.sweep(Duration::ZERO, 2).await.unwrap();
            assert_eq!(reclaimed[0].outcome, FailOutcome::Retrying);
            assert_eq!(reclaimed[0].retry_count, expected);
            assert!(listener.wait(Duration::from_millis(10)).await);
        }

        store.claim_next("w").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = reclaimer.sweep(Duration::ZERO, 2).await.unwrap();
        assert_eq!(reclaimed[0].outcome, FailOutcome::Failed);
        assert_eq!(reclaimed[0].retry_count, 2);
        assert!(!listener.is_pending());

        let counts = store.counts().await.unwrap();
        assert_eq!((counts.pending, counts.processing, counts.failed), (0, 0, 1));
        assert!(store.claim_next("w").await.unwrap().is_none());
    }
}
