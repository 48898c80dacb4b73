//! File discoverer: finds new recordings and enqueues them as `pending`.
//!
//! One pass enumerates the configured sources, drops what is already
//! queued, probes the rest for duration and recording start (falling back
//! to the file's mtime), applies the time-window, active-source and
//! working-hours filters, and batch-inserts the survivors in recording
//! order. Per-file problems are logged and skipped; only loss of the store
//! aborts a pass.

pub mod candidate;
pub mod probe;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use packline_core::backoff::{next_delay, BackoffConfig};
use packline_core::ffmpeg::MediaInfo;
use packline_core::hashing::file_fingerprint;
use packline_core::pipeline_events::{EVENT_SCAN_BATCH_DROPPED, EVENT_SCAN_COMPLETED};
use packline_core::pool::PoolConfig;
use packline_core::schedule::TimeWindow;
use packline_core::types::{from_millis, now_millis, to_millis};
use packline_db::models::queue_item::NewQueueItem;
use packline_db::{Store, StoreError};
use packline_events::{EventBus, PipelineEvent, WakeSignal};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoverySettings;
use candidate::{enumerate_paths, enumerate_sources, Candidate, Enumeration};
use probe::MediaProbe;

/// How the next pass chooses its time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DiscoveryMode {
    /// Backfill recordings from the last `days_back` days, then continue
    /// incrementally.
    FirstRun { days_back: u32 },
    /// Incremental: files modified since the last scan (minus overlap).
    Default,
    /// One pass over specific files or directories, no time window.
    Custom { paths: Vec<PathBuf> },
}

impl DiscoveryMode {
    pub fn label(&self) -> &'static str {
        match self {
            DiscoveryMode::FirstRun { .. } => "first_run",
            DiscoveryMode::Default => "default",
            DiscoveryMode::Custom { .. } => "custom",
        }
    }
}

/// Which timestamp the pass window is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowBasis {
    /// Recording start (probe, else mtime): backfills.
    Recorded,
    /// File modification time: incremental scans, so late-synced files of
    /// old recordings are still picked up.
    Modified,
}

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub mode: &'static str,
    pub enumerated: usize,
    pub already_known: usize,
    pub filtered: usize,
    pub probe_failures: usize,
    pub inserted: u64,
    pub dropped: usize,
    pub errors: usize,
    pub cancelled: bool,
}

pub struct Discoverer {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    probe: Arc<dyn MediaProbe>,
    settings: DiscoverySettings,
    work_ready: WakeSignal,
}

impl Discoverer {
    pub fn new(
        store: Arc<Store>,
        bus: Arc<EventBus>,
        probe: Arc<dyn MediaProbe>,
        settings: DiscoverySettings,
        work_ready: WakeSignal,
    ) -> Self {
        Self {
            store,
            bus,
            probe,
            settings,
            work_ready,
        }
    }

    /// Run one pass. Cancellation is observed between files; a cancelled
    /// pass inserts nothing and leaves the watermark alone.
    pub async fn scan(
        &self,
        mode: &DiscoveryMode,
        cancel: &CancellationToken,
    ) -> Result<ScanReport, StoreError> {
        let started_ms = now_millis();
        let (window, basis) = self.window_for(mode).await?;
        let enumeration = self.enumerate(mode).await;

        let mut report = ScanReport {
            mode: mode.label(),
            enumerated: enumeration.candidates.len(),
            errors: enumeration.errors,
            ..ScanReport::default()
        };

        let mut batch = Vec::new();
        for candidate in &enumeration.candidates {
            if cancel.is_cancelled() {
                report.cancelled = true;
                tracing::info!(mode = report.mode, "Discovery pass cancelled");
                return Ok(report);
            }
            if let Some(item) = self.evaluate(candidate, &window, basis, &mut report).await? {
                batch.push(item);
            }
        }

        // Claims are FIFO by id, so insertion order is processing order.
        batch.sort_by(|a, b| {
            a.recorded_at_ms
                .cmp(&b.recorded_at_ms)
                .then_with(|| a.source_path.cmp(&b.source_path))
        });
        for chunk in batch.chunks(self.settings.insert_batch_size.max(1)) {
            report.inserted += self.insert_chunk(chunk, &mut report).await?;
        }

        if report.inserted > 0 {
            self.work_ready.notify();
        }
        if !matches!(mode, DiscoveryMode::Custom { .. }) {
            self.store.set_last_scan_at(started_ms).await?;
        }

        tracing::info!(
            mode = report.mode,
            enumerated = report.enumerated,
            inserted = report.inserted,
            already_known = report.already_known,
            filtered = report.filtered,
            probe_failures = report.probe_failures,
            dropped = report.dropped,
            errors = report.errors,
            "Discovery pass complete",
        );
        self.bus.publish(
            PipelineEvent::new(EVENT_SCAN_COMPLETED)
                .with_payload(serde_json::to_value(&report).unwrap_or_default()),
        );
        Ok(report)
    }

    /// Scan on the configured cadence until cancelled.
    ///
    /// A first-run pass is followed by incremental passes; a custom pass
    /// runs once. While the store is unreachable, passes are retried with
    /// backoff instead of on the scan interval.
    pub async fn run(
        self,
        mode: DiscoveryMode,
        config: watch::Receiver<PoolConfig>,
        cancel: CancellationToken,
    ) {
        let retry = BackoffConfig::unavailable();
        let mut retry_delay = retry.initial_delay;
        let mut mode = mode;
        tracing::info!(mode = mode.label(), "File discoverer started");

        loop {
            let wait = match self.scan(&mode, &cancel).await {
                Ok(report) if report.cancelled => break,
                Ok(_) => {
                    retry_delay = retry.initial_delay;
                    match mode {
                        DiscoveryMode::Custom { .. } => {
                            tracing::info!("Custom discovery finished");
                            break;
                        }
                        DiscoveryMode::FirstRun { .. } => mode = DiscoveryMode::Default,
                        DiscoveryMode::Default => {}
                    }
                    config.borrow().scan_interval
                }
                Err(e) => {
                    tracing::error!(error = %e, retry_in_ms = retry_delay.as_millis() as u64, "Discovery pass failed");
                    let wait = retry_delay;
                    retry_delay = next_delay(retry_delay, &retry);
                    wait
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::info!("File discoverer stopped");
    }

    async fn window_for(&self, mode: &DiscoveryMode) -> Result<(TimeWindow, WindowBasis), StoreError> {
        Ok(match mode {
            DiscoveryMode::FirstRun { days_back } => (
                TimeWindow {
                    from: Some(chrono::Utc::now() - chrono::Duration::days(i64::from(*days_back))),
                    until: None,
                },
                WindowBasis::Recorded,
            ),
            DiscoveryMode::Default => {
                let overlap_ms = i64::try_from(self.settings.scan_overlap.as_millis()).unwrap_or(i64::MAX);
                let from = self
                    .store
                    .last_scan_at()
                    .await?
                    .map(|at| from_millis(at.saturating_sub(overlap_ms)));
                (TimeWindow { from, until: None }, WindowBasis::Modified)
            }
            DiscoveryMode::Custom { .. } => (TimeWindow::unbounded(), WindowBasis::Recorded),
        })
    }

    async fn enumerate(&self, mode: &DiscoveryMode) -> Enumeration {
        let sources = self.settings.sources.clone();
        let extensions = self.settings.extensions.clone();
        let paths = match mode {
            DiscoveryMode::Custom { paths } => Some(paths.clone()),
            _ => None,
        };
        let result = tokio::task::spawn_blocking(move || match paths {
            Some(paths) => enumerate_paths(&paths, &sources, &extensions),
            None => enumerate_sources(&sources, &extensions),
        })
        .await;
        result.unwrap_or_else(|e| {
            tracing::error!(error = %e, "Directory enumeration task failed");
            Enumeration {
                candidates: Vec::new(),
                errors: 1,
            }
        })
    }

    /// Decide whether one candidate should be enqueued.
    async fn evaluate(
        &self,
        candidate: &Candidate,
        window: &TimeWindow,
        basis: WindowBasis,
        report: &mut ScanReport,
    ) -> Result<Option<NewQueueItem>, StoreError> {
        if let Some(active) = &self.settings.active_sources {
            if !active.iter().any(|camera| camera == &candidate.camera_id) {
                report.filtered += 1;
                return Ok(None);
            }
        }
        if basis == WindowBasis::Modified && !window.contains(candidate.modified_at()) {
            report.filtered += 1;
            return Ok(None);
        }

        let source_path = candidate.path_string();
        match self.store.is_known(&source_path, candidate.mtime_ms).await {
            Ok(true) => {
                report.already_known += 1;
                return Ok(None);
            }
            Ok(false) => {}
            Err(e) if e.is_unavailable() => return Err(e),
            Err(e) => {
                tracing::warn!(path = %source_path, error = %e, "Dedup lookup failed, skipping file");
                report.errors += 1;
                return Ok(None);
            }
        }

        let info = match self.probe.probe(&candidate.path).await {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!(path = %source_path, error = %e, "Probe failed, falling back to mtime");
                report.probe_failures += 1;
                MediaInfo {
                    duration_ms: None,
                    created_at: None,
                }
            }
        };
        let recorded_at = info.created_at.unwrap_or_else(|| candidate.modified_at());

        if basis == WindowBasis::Recorded && !window.contains(recorded_at) {
            report.filtered += 1;
            return Ok(None);
        }
        if !self.settings.schedule.accepts(recorded_at) {
            report.filtered += 1;
            return Ok(None);
        }

        let fingerprint = if self.settings.fingerprint {
            match self.fingerprint(candidate).await {
                Some(fp) => match self.store.is_fingerprint_known(&fp).await {
                    Ok(true) => {
                        report.already_known += 1;
                        return Ok(None);
                    }
                    Ok(false) => Some(fp),
                    Err(e) if e.is_unavailable() => return Err(e),
                    Err(e) => {
                        tracing::warn!(path = %source_path, error = %e, "Fingerprint lookup failed");
                        Some(fp)
                    }
                },
                None => {
                    report.errors += 1;
                    None
                }
            }
        } else {
            None
        };

        Ok(Some(NewQueueItem {
            source_path,
            camera_id: candidate.camera_id.clone(),
            mtime_ms: candidate.mtime_ms,
            fingerprint,
            recorded_at_ms: to_millis(recorded_at),
            duration_ms: info.duration_ms,
        }))
    }

    async fn fingerprint(&self, candidate: &Candidate) -> Option<String> {
        let path = candidate.path.clone();
        match tokio::task::spawn_blocking(move || file_fingerprint(&path)).await {
            Ok(Ok(fp)) => Some(fp),
            Ok(Err(e)) => {
                tracing::warn!(path = %candidate.path.display(), error = %e, "Failed to fingerprint file");
                None
            }
            Err(e) => {
                tracing::warn!(path = %candidate.path.display(), error = %e, "Fingerprint task failed");
                None
            }
        }
    }

    /// Insert one chunk, retrying once. A chunk that fails twice is dropped
    /// and reported; an unreachable store aborts the pass.
    async fn insert_chunk(
        &self,
        chunk: &[NewQueueItem],
        report: &mut ScanReport,
    ) -> Result<u64, StoreError> {
        let first = match self.store.enqueue(chunk).await {
            Ok(inserted) => return Ok(inserted),
            Err(e) if e.is_unavailable() => return Err(e),
            Err(e) => e,
        };
        tracing::warn!(rows = chunk.len(), error = %first, "Batch insert failed, retrying once");
        tokio::time::sleep(Duration::from_millis(100)).await;

        match self.store.enqueue(chunk).await {
            Ok(inserted) => Ok(inserted),
            Err(e) if e.is_unavailable() => Err(e),
            Err(e) => {
                tracing::error!(rows = chunk.len(), error = %e, "Batch insert failed twice, dropping batch");
                report.dropped += chunk.len();
                let paths: Vec<&str> = chunk.iter().map(|i| i.source_path.as_str()).collect();
                self.bus.publish(PipelineEvent::new(EVENT_SCAN_BATCH_DROPPED).with_payload(
                    serde_json::json!({
                        "rows": chunk.len(),
                        "error": e.to_string(),
                        "paths": paths,
                    }),
                ));
                Ok(0)
            }
        }
    }
}
