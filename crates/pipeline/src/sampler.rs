//! Sampler workers: claim pending items and stream detector output into
//! the detection log.
//!
//! A worker owns at most one claim at a time. While the detector runs, the
//! worker re-checks its claim every `wait_timeout`; if the reclaimer has
//! revoked it, the detection stream is dropped (killing the detector) and
//! the worker exits so the pool can replace it with a fresh identity.
//! Every store write is conditional on the claim, so a revoked worker can
//! never touch the item again.
//!
//! Cancellation is observed between items only. An item in flight runs to
//! completion or failure.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use packline_core::backoff::{next_delay, BackoffConfig};
use packline_core::detector::{DetectRequest, DetectionRecord, Detector, DetectorError};
use packline_core::pipeline_events::{
    EVENT_ITEM_CLAIMED, EVENT_ITEM_COMPLETED, EVENT_ITEM_FAILED, EVENT_ITEM_RETRIED,
};
use packline_core::pool::PoolConfig;
use packline_core::types::DbId;
use packline_db::models::queue_item::{ClaimToken, FailOutcome, QueueItem};
use packline_db::{Store, StoreError};
use packline_events::{EventBus, PipelineEvent, WakeListener, WakeSignal};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::backpressure::BackpressureGate;
use crate::config::SamplerSettings;

/// Shared handles every worker needs.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<Store>,
    pub bus: Arc<EventBus>,
    pub detector: Arc<dyn Detector>,
    pub gate: Arc<BackpressureGate>,
    /// Raised when pending work appears.
    pub work_ready: WakeSignal,
    /// Raised after an item completes.
    pub logs_ready: WakeSignal,
    /// Raised by the synthesizer after each pass.
    pub caught_up: WakeSignal,
    pub paused: Arc<AtomicBool>,
    pub config: watch::Receiver<PoolConfig>,
    pub sampler: SamplerSettings,
    /// Upper bound on every wait, and the claim-check cadence.
    pub wait_timeout: Duration,
}

/// Why a worker's loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Cancelled between items.
    Cancelled,
    /// Its claim was revoked mid-item.
    ClaimLost { item_id: DbId },
}

/// How one item ended, from the worker's point of view.
enum Step {
    Finished,
    ClaimLost(DbId),
    /// Cancelled while the store was unreachable; the claim is left for
    /// the reclaimer.
    Abandoned,
}

pub struct SamplerWorker {
    identity: String,
    ctx: WorkerContext,
    cancel: CancellationToken,
}

impl SamplerWorker {
    pub fn new(identity: String, ctx: WorkerContext, cancel: CancellationToken) -> Self {
        Self {
            identity,
            ctx,
            cancel,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Claim and process items until cancelled or until a claim is lost.
    pub async fn run(self) -> WorkerExit {
        let mut work_ready = self.ctx.work_ready.listener();
        let mut caught_up = self.ctx.caught_up.listener();
        let retry = BackoffConfig::unavailable();
        let mut delay = retry.initial_delay;

        tracing::info!(worker = %self.identity, "Sampler worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.ctx.paused.load(Ordering::Acquire) {
                self.wait_on(&mut work_ready).await;
                continue;
            }

            let depth_limit = self.ctx.config.borrow().queue_depth_limit;
            match self.ctx.gate.check(&self.ctx.store, depth_limit).await {
                Ok(true) => {
                    let releases = self.ctx.gate.releases();
                    self.wait_on(&mut caught_up).await;
                    if self.ctx.gate.releases() == releases
                        || self.cancel.is_cancelled()
                        || self.ctx.paused.load(Ordering::Acquire)
                    {
                        continue;
                    }
                    // Synthesis caught up while blocked: one claim before
                    // the gate is evaluated again.
                }
                Ok(false) => {}
                Err(e) => {
                    self.store_backoff("backpressure check", &e, &mut delay, &retry).await;
                    continue;
                }
            }

            let item = match self.ctx.store.claim_next(&self.identity).await {
                Ok(Some(item)) => item,
                Ok(None) => {
                    self.wait_on(&mut work_ready).await;
                    continue;
                }
                Err(e) => {
                    self.store_backoff("claim", &e, &mut delay, &retry).await;
                    continue;
                }
            };
            delay = retry.initial_delay;

            match self.process(item).await {
                Step::Finished => {}
                Step::Abandoned => break,
                Step::ClaimLost(item_id) => {
                    tracing::warn!(
                        worker = %self.identity,
                        item_id,
                        "Claim revoked mid-item, worker exiting",
                    );
                    return WorkerExit::ClaimLost { item_id };
                }
            }
        }

        tracing::info!(worker = %self.identity, "Sampler worker stopped");
        WorkerExit::Cancelled
    }

    async fn process(&self, item: QueueItem) -> Step {
        let Some(token) = item.claim() else {
            tracing::error!(item_id = item.id, "Claimed item is not processing");
            return Step::Finished;
        };

        tracing::info!(
            worker = %self.identity,
            item_id = item.id,
            attempt = token.attempt,
            path = %item.source_path,
            "Processing item",
        );
        self.ctx.bus.publish(
            PipelineEvent::new(EVENT_ITEM_CLAIMED)
                .with_item(item.id)
                .with_worker(self.identity.as_str())
                .with_payload(serde_json::json!({
                    "source_path": item.source_path,
                    "attempt": token.attempt,
                })),
        );

        let request = DetectRequest {
            path: PathBuf::from(&item.source_path),
            frame_interval: self.ctx.sampler.frame_interval,
            roi: self.ctx.sampler.roi,
        };
        let batch_size = self.ctx.sampler.log_batch_size.max(1);
        let mut stream = self.ctx.detector.detect(request);
        let mut buffer: Vec<DetectionRecord> = Vec::with_capacity(batch_size);
        let mut detections = 0usize;

        let mut claim_check = tokio::time::interval(self.ctx.wait_timeout);
        claim_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        claim_check.tick().await;

        let outcome: Result<(), DetectorError> = loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(record)) => {
                        detections += 1;
                        buffer.push(record);
                        if buffer.len() >= batch_size {
                            match self.flush(&token, &mut buffer, item.duration_ms).await {
                                Some(true) => {}
                                Some(false) => return Step::ClaimLost(item.id),
                                None => return Step::Abandoned,
                            }
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                },
                _ = claim_check.tick() => {
                    if !self.claim_still_held(&token).await {
                        return Step::ClaimLost(item.id);
                    }
                }
            }
        };
        drop(stream);

        match outcome {
            Ok(()) => self.finish(&item, &token, &mut buffer, detections).await,
            Err(e) => self.record_failure(&item, &token, e).await,
        }
    }

    async fn finish(
        &self,
        item: &QueueItem,
        token: &ClaimToken,
        buffer: &mut Vec<DetectionRecord>,
        detections: usize,
    ) -> Step {
        match self.flush(token, buffer, item.duration_ms).await {
            Some(true) => {}
            Some(false) => return Step::ClaimLost(item.id),
            None => return Step::Abandoned,
        }

        let store = &self.ctx.store;
        match self.persist("complete", || store.complete(token)).await {
            Some(true) => {
                tracing::info!(
                    worker = %self.identity,
                    item_id = item.id,
                    detections,
                    "Item completed",
                );
                self.ctx.logs_ready.notify();
                self.ctx.bus.publish(
                    PipelineEvent::new(EVENT_ITEM_COMPLETED)
                        .with_item(item.id)
                        .with_worker(self.identity.as_str())
                        .with_payload(serde_json::json!({
                            "attempt": token.attempt,
                            "detections": detections,
                        })),
                );
                Step::Finished
            }
            Some(false) => Step::ClaimLost(item.id),
            None => Step::Abandoned,
        }
    }

    async fn record_failure(&self, item: &QueueItem, token: &ClaimToken, error: DetectorError) -> Step {
        let kind = error.kind();
        let message = error.to_string();
        let max_retries = self.ctx.config.borrow().max_retries;
        let store = &self.ctx.store;

        let outcome = self
            .persist("fail", || store.fail(token, kind, &message, max_retries))
            .await;
        let Some(outcome) = outcome else {
            return Step::Abandoned;
        };

        let event = match outcome {
            FailOutcome::Retrying => {
                tracing::warn!(
                    worker = %self.identity,
                    item_id = item.id,
                    retry_count = item.retry_count + 1,
                    error = %message,
                    "Item failed, will retry",
                );
                self.ctx.work_ready.notify();
                EVENT_ITEM_RETRIED
            }
            FailOutcome::Failed => {
                tracing::error!(
                    worker = %self.identity,
                    item_id = item.id,
                    error = %message,
                    "Item failed permanently",
                );
                EVENT_ITEM_FAILED
            }
            FailOutcome::ClaimLost => return Step::ClaimLost(item.id),
        };
        self.ctx.bus.publish(
            PipelineEvent::new(event)
                .with_item(item.id)
                .with_worker(self.identity.as_str())
                .with_payload(serde_json::json!({
                    "attempt": token.attempt,
                    "error": message,
                })),
        );
        Step::Finished
    }

    /// Append buffered records under the claim. `Some(false)` means the
    /// claim is gone; `None` means cancelled during a store outage.
    async fn flush(
        &self,
        token: &ClaimToken,
        buffer: &mut Vec<DetectionRecord>,
        duration_ms: Option<i64>,
    ) -> Option<bool> {
        if buffer.is_empty() {
            return Some(true);
        }
        let records = std::mem::take(buffer);
        let progress = records
            .last()
            .and_then(|last| progress_percent(last.offset_ms, duration_ms));
        let store = &self.ctx.store;
        self.persist("append_logs", || store.append_logs(token, &records, progress))
            .await
    }

    /// A failed check is treated as still held; the sweep and the
    /// conditional writes are authoritative.
    async fn claim_still_held(&self, token: &ClaimToken) -> bool {
        match self.ctx.store.is_claim_held(token).await {
            Ok(held) => held,
            Err(e) => {
                tracing::warn!(worker = %self.identity, error = %e, "Claim check failed");
                true
            }
        }
    }

    /// Retry a store write until it succeeds or the worker is cancelled.
    async fn persist<T, F, Fut>(&self, op: &'static str, mut f: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let retry = BackoffConfig::unavailable();
        let mut delay = retry.initial_delay;
        loop {
            match f().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    tracing::warn!(
                        worker = %self.identity,
                        op,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Store write failed, retrying",
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            tracing::warn!(worker = %self.identity, op, "Abandoning claim during shutdown");
                            return None;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = next_delay(delay, &retry);
                }
            }
        }
    }

    async fn wait_on(&self, listener: &mut WakeListener) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = listener.wait(self.ctx.wait_timeout) => {}
        }
    }

    async fn store_backoff(
        &self,
        op: &'static str,
        error: &StoreError,
        delay: &mut Duration,
        retry: &BackoffConfig,
    ) {
        tracing::warn!(
            worker = %self.identity,
            op,
            error = %error,
            retry_in_ms = delay.as_millis() as u64,
            "Store unavailable to worker",
        );
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(*delay) => {}
        }
        *delay = next_delay(*delay, retry);
    }
}

/// Progress through the file, kept below 100 until the item completes.
pub fn progress_percent(offset_ms: i64, duration_ms: Option<i64>) -> Option<i64> {
    let duration = duration_ms.filter(|d| *d > 0)?;
    Some((offset_ms.max(0).saturating_mul(100) / duration).clamp(0, 99))
}
