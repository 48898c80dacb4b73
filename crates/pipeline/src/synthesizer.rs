//! Event synthesizer: the single consumer of completed detection logs.
//!
//! Items are consumed strictly in completion order. For each item the
//! logs of the completing attempt are coalesced into packing events, and
//! the events are stored together with the advanced checkpoint in one
//! transaction, so a crash never loses or duplicates an item's events.

use std::sync::Arc;
use std::time::Duration;

use packline_core::backoff::{next_delay, BackoffConfig};
use packline_core::coalesce::{coalesce, CoalesceConfig};
use packline_core::detector::DetectionRecord;
use packline_core::pipeline_events::EVENT_EVENTS_SYNTHESIZED;
use packline_core::types::DbId;
use packline_db::models::packing_event::NewPackingEvent;
use packline_db::models::queue_item::QueueItem;
use packline_db::{Store, StoreError};
use packline_events::{EventBus, PipelineEvent, WakeListener, WakeSignal};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backpressure::BackpressureGate;

/// Completed items fetched per query.
pub const DEFAULT_BATCH_LIMIT: i64 = 100;

/// Summary of one synthesis pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub items: usize,
    pub events: u64,
    pub checkpoint: i64,
}

/// Coalesce one item's detections into events anchored at its recording
/// start. Pure: the same item and records always yield the same events.
pub fn synthesize_item(
    item: &QueueItem,
    records: &[DetectionRecord],
    config: &CoalesceConfig,
) -> Vec<NewPackingEvent> {
    coalesce(records, config)
        .into_iter()
        .map(|window| NewPackingEvent {
            item_id: item.id,
            camera_id: item.camera_id.clone(),
            started_at_ms: item.recorded_at_ms + window.start_offset_ms,
            ended_at_ms: item.recorded_at_ms + window.end_offset_ms,
            detection_count: window.detection_count as i64,
            metadata: serde_json::json!({
                "item_id": item.id,
                "source_path": item.source_path,
                "detection_count": window.detection_count,
                "codes": window.codes,
                "start_offset_ms": window.start_offset_ms,
                "end_offset_ms": window.end_offset_ms,
            }),
        })
        .collect()
}

pub struct EventSynthesizer {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    coalesce: CoalesceConfig,
    gate: Arc<BackpressureGate>,
    caught_up: WakeSignal,
    batch_limit: i64,
}

impl EventSynthesizer {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        coalesce: CoalesceConfig,
        gate: Arc<BackpressureGate>,
        caught_up: WakeSignal,
    ) -> Self {
        Self {
            store,
            bus,
            coalesce,
            gate,
            caught_up,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    /// Consume every item completed since the checkpoint, then release
    /// backpressure and signal the workers.
    pub async fn run_pass(&self) -> Result<PassReport, StoreError> {
        let mut report = PassReport {
            checkpoint: self.store.synth_checkpoint().await?,
            ..PassReport::default()
        };

        loop {
            let items = self
                .store
                .completed_since(report.checkpoint, self.batch_limit)
                .await?;
            if items.is_empty() {
                break;
            }
            for item in &items {
                let Some(seq) = item.completed_seq else {
                    continue;
                };
                let events = self.events_for(item).await?;
                let inserted = self.store.record_events(&events, seq).await?;
                tracing::debug!(
                    item_id = item.id,
                    completed_seq = seq,
                    events = inserted,
                    "Item synthesized",
                );
                report.checkpoint = seq;
                report.items += 1;
                report.events += inserted;
            }
        }

        if report.items > 0 {
            tracing::info!(
                items = report.items,
                events = report.events,
                checkpoint = report.checkpoint,
                "Synthesis pass complete",
            );
            self.bus.publish(
                PipelineEvent::new(EVENT_EVENTS_SYNTHESIZED)
                    .with_payload(serde_json::to_value(report).unwrap_or_default()),
            );
        }

        self.gate.release();
        self.caught_up.notify();
        Ok(report)
    }

    /// Recompute the events for one `done` item from its stored logs
    /// without writing anything.
    pub async fn resynthesize(&self, item_id: DbId) -> Result<Option<Vec<NewPackingEvent>>, StoreError> {
        let Some(item) = self.store.find_item(item_id).await? else {
            return Ok(None);
        };
        if item.completed_seq.is_none() {
            return Ok(None);
        }
        let records = self.store.detections(item.id, item.attempt).await?;
        Ok(Some(synthesize_item(&item, &records, &self.coalesce)))
    }

    /// Undecodable logs yield no events so the checkpoint can still move.
    async fn events_for(&self, item: &QueueItem) -> Result<Vec<NewPackingEvent>, StoreError> {
        match self.store.detections(item.id, item.attempt).await {
            Ok(records) => Ok(synthesize_item(item, &records, &self.coalesce)),
            Err(StoreError::Corrupt(reason)) => {
                tracing::error!(item_id = item.id, error = %reason, "Skipping item with corrupt detection logs");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Run a pass on startup, then after every `logs_ready` signal or
    /// `wait_timeout`, until cancelled.
    pub async fn run(self, mut logs_ready: WakeListener, wait_timeout: Duration, cancel: CancellationToken) {
        let retry = BackoffConfig::unavailable();
        let mut delay = retry.initial_delay;
        tracing::info!("Event synthesizer started");

        loop {
            let wait = match self.run_pass().await {
                Ok(_) => {
                    delay = retry.initial_delay;
                    None
                }
                Err(e) => {
                    tracing::error!(error = %e, retry_in_ms = delay.as_millis() as u64, "Synthesis pass failed");
                    let wait = delay;
                    delay = next_delay(delay, &retry);
                    Some(wait)
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = async {
                    match wait {
                        Some(backoff) => tokio::time::sleep(backoff).await,
                        None => {
                            logs_ready.wait(wait_timeout).await;
                        }
                    }
                } => {}
            }
        }
        tracing::info!("Event synthesizer stopped");
    }
}
