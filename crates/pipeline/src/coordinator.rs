//! Pipeline coordinator: the single owner of scheduler state.
//!
//! The coordinator starts and stops the long-lived actors (discoverer,
//! synthesizer, reclaimer, resource monitor, resize timer) and the
//! sampler pool, and answers the control surface: pause/resume, manual
//! resize, status, progress and live pool-configuration updates.
//!
//! Live pool configuration is published over a `watch` channel; the
//! coordinator is its only writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use packline_core::detector::Detector;
use packline_core::pipeline_events::EVENT_POOL_RESIZED;
use packline_core::pool::PoolConfig;
use packline_core::queue::ItemStatus;
use packline_core::types::{from_millis, DbId, Timestamp};
use packline_db::models::packing_event::NewPackingEvent;
use packline_db::models::queue_item::StatusCounts;
use packline_db::{Store, StoreHealth};
use packline_events::{EventBus, PipelineEvent, WakeSignal};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backpressure::BackpressureGate;
use crate::config::PipelineConfig;
use crate::discovery::probe::MediaProbe;
use crate::discovery::{Discoverer, DiscoveryMode, ScanReport};
use crate::error::PipelineError;
use crate::monitor::{ResourceMonitor, SharedSampler};
use crate::pool::WorkerPool;
use crate::reclaimer::Reclaimer;
use crate::sampler::WorkerContext;
use crate::synthesizer::{EventSynthesizer, PassReport};

/// Snapshot returned by [`Coordinator::status`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub running: bool,
    pub paused: bool,
    pub mode: Option<DiscoveryMode>,
    pub pool_size: usize,
    /// Workers finishing their last item after a shrink.
    pub draining: usize,
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
    pub last_scan_at: Option<Timestamp>,
    pub backpressure: bool,
    pub synthesis_lag: Option<i64>,
    pub recommended_pool_size: usize,
    /// Counts and scan time are the last values read before the store
    /// became unreachable.
    pub stale: bool,
    pub store: StoreHealth,
}

/// One in-flight item, as returned by [`Coordinator::progress`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemProgress {
    pub item_id: DbId,
    pub source_path: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<Timestamp>,
    /// `None` while the file's duration is unknown.
    pub percent: Option<i64>,
}

/// Last successfully read queue snapshot.
#[derive(Debug, Clone, Copy, Default)]
struct Snapshot {
    counts: StatusCounts,
    last_scan_at_ms: Option<i64>,
}

/// Handles owned while the pipeline runs.
struct Running {
    mode: DiscoveryMode,
    cancel: CancellationToken,
    pool: Arc<WorkerPool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

pub struct Coordinator {
    store: Arc<Store>,
    bus: Arc<EventBus>,
    detector: Arc<dyn Detector>,
    probe: Arc<dyn MediaProbe>,
    monitor: ResourceMonitor,
    gate: Arc<BackpressureGate>,
    work_ready: WakeSignal,
    logs_ready: WakeSignal,
    caught_up: WakeSignal,
    paused: Arc<AtomicBool>,
    config: PipelineConfig,
    pool_config: watch::Sender<PoolConfig>,
    running: Mutex<Option<Running>>,
    snapshot: StdMutex<Snapshot>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(
        store: Arc<Store>,
        detector: Arc<dyn Detector>,
        probe: Arc<dyn MediaProbe>,
        sampler: SharedSampler,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let (pool_config, _) = watch::channel(config.pool.clone());
        let monitor = ResourceMonitor::new(sampler, config.pool.clamp_size(config.pool.initial_workers));

        Ok(Self {
            store,
            bus: Arc::new(EventBus::default()),
            detector,
            probe,
            monitor,
            gate: Arc::new(BackpressureGate::new()),
            work_ready: WakeSignal::new("work_ready"),
            logs_ready: WakeSignal::new("logs_ready"),
            caught_up: WakeSignal::new("caught_up"),
            paused: Arc::new(AtomicBool::new(false)),
            config,
            pool_config,
            running: Mutex::new(None),
            snapshot: StdMutex::new(Snapshot::default()),
        })
    }

    /// Subscribe to pipeline events.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.bus.subscribe()
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Current live pool configuration.
    pub fn config(&self) -> PoolConfig {
        self.pool_config.borrow().clone()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start discovery in `mode`, the synthesizer, the background sweeps
    /// and the initial workers.
    pub async fn start(&self, mode: DiscoveryMode) -> Result<(), PipelineError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let pool_config = self.config();
        let cancel = CancellationToken::new();
        self.paused.store(false, Ordering::Release);

        let ctx = WorkerContext {
            store: Arc::clone(&self.store),
            bus: Arc::clone(&self.bus),
            detector: Arc::clone(&self.detector),
            gate: Arc::clone(&self.gate),
            work_ready: self.work_ready.clone(),
            logs_ready: self.logs_ready.clone(),
            caught_up: self.caught_up.clone(),
            paused: Arc::clone(&self.paused),
            config: self.pool_config.subscribe(),
            sampler: self.config.sampler.clone(),
            wait_timeout: self.config.wait_timeout,
        };
        let (pool, exits) = WorkerPool::new(ctx, &self.config.node_name, cancel.child_token());

        let mut tasks = Vec::new();
        tasks.push((
            "supervisor",
            tokio::spawn(Arc::clone(&pool).supervise(exits)),
        ));
        tasks.push((
            "synthesizer",
            tokio::spawn(self.synthesizer().run(
                self.logs_ready.listener(),
                self.config.wait_timeout,
                cancel.child_token(),
            )),
        ));
        tasks.push((
            "discoverer",
            tokio::spawn(
                Discoverer::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.bus),
                    Arc::clone(&self.probe),
                    self.config.discovery.clone(),
                    self.work_ready.clone(),
                )
                .run(mode.clone(), self.pool_config.subscribe(), cancel.child_token()),
            ),
        ));
        tasks.push((
            "reclaimer",
            tokio::spawn(
                Reclaimer::new(
                    Arc::clone(&self.store),
                    Arc::clone(&self.bus),
                    self.work_ready.clone(),
                )
                .run(self.pool_config.subscribe(), cancel.child_token()),
            ),
        ));

        let initial = pool_config.clamp_size(pool_config.initial_workers);
        self.monitor.reset(initial);
        tasks.push((
            "monitor",
            tokio::spawn(self.monitor.clone().run(
                self.config.monitor_interval,
                self.pool_config.subscribe(),
                cancel.child_token(),
            )),
        ));
        tasks.push((
            "resize_timer",
            tokio::spawn(resize_timer(
                Arc::clone(&pool),
                self.monitor.clone(),
                Arc::clone(&self.bus),
                self.pool_config.subscribe(),
                self.config.resize_interval,
                cancel.child_token(),
            )),
        ));

        let size = pool.resize(initial).await;
        tracing::info!(mode = mode.label(), workers = size, "Pipeline started");

        *running = Some(Running {
            mode,
            cancel,
            pool,
            tasks,
        });
        Ok(())
    }

    /// Graceful drain: stop discovery and the sweeps, let workers finish
    /// their current item (up to the shutdown timeout), then run a final
    /// synthesis pass so completed work is not left unconsumed.
    pub async fn stop(&self) -> Result<(), PipelineError> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(PipelineError::NotRunning);
        };
        tracing::info!("Stopping pipeline");

        running.cancel.cancel();
        let clean = running.pool.shutdown(self.config.shutdown_timeout).await;

        for (name, handle) in running.tasks {
            if tokio::time::timeout(self.config.shutdown_timeout, handle)
                .await
                .is_err()
            {
                tracing::warn!(task = name, "Task did not stop in time, detaching");
            }
        }

        match self.synthesizer().run_pass().await {
            Ok(report) => tracing::debug!(items = report.items, "Final synthesis pass complete"),
            Err(e) => tracing::warn!(error = %e, "Final synthesis pass failed"),
        }

        self.paused.store(false, Ordering::Release);
        tracing::info!(clean, "Pipeline stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Stop new claims. Workers finish their current item and then idle.
    pub async fn pause(&self) -> Result<(), PipelineError> {
        self.ensure_running().await?;
        if !self.paused.swap(true, Ordering::AcqRel) {
            tracing::info!("Pipeline paused");
        }
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), PipelineError> {
        self.ensure_running().await?;
        if self.paused.swap(false, Ordering::AcqRel) {
            tracing::info!("Pipeline resumed");
            self.work_ready.notify();
        }
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Resize the pool to `target`, clamped to the configured bounds.
    /// Returns the resulting size.
    pub async fn resize(&self, target: usize) -> Result<usize, PipelineError> {
        let running = self.running.lock().await;
        let Some(running) = running.as_ref() else {
            return Err(PipelineError::NotRunning);
        };
        let clamped = self.config().clamp_size(target);
        let from = running.pool.size().await;
        let size = running.pool.resize(clamped).await;
        self.monitor.reset(size);
        publish_resize(&self.bus, from, size, "manual");
        Ok(size)
    }

    /// Validate and publish a new pool configuration. A running pool is
    /// clamped into the new bounds immediately.
    pub async fn update_config(&self, pool_config: PoolConfig) -> Result<(), PipelineError> {
        pool_config.validate()?;
        self.pool_config.send_replace(pool_config.clone());
        tracing::info!(
            min_workers = pool_config.min_workers,
            max_workers = pool_config.max_workers,
            queue_depth_limit = pool_config.queue_depth_limit,
            "Pool configuration updated",
        );

        self.monitor
            .reset(pool_config.clamp_size(self.monitor.recommended()));
        if let Some(running) = self.running.lock().await.as_ref() {
            let from = running.pool.size().await;
            let target = pool_config.clamp_size(from);
            if target != from {
                let size = running.pool.resize(target).await;
                publish_resize(&self.bus, from, size, "config");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    /// Pool and queue state. Never fails: while the store is unreachable
    /// the last known counts are returned with `stale` set.
    pub async fn status(&self) -> StatusReport {
        let (running, mode, pool_size, draining) = match self.running.lock().await.as_ref() {
            Some(running) => (
                true,
                Some(running.mode.clone()),
                running.pool.size().await,
                running.pool.draining().await,
            ),
            None => (false, None, 0, 0),
        };

        let fresh = match (self.store.counts().await, self.store.last_scan_at().await) {
            (Ok(counts), Ok(last_scan_at_ms)) => {
                let snapshot = Snapshot {
                    counts,
                    last_scan_at_ms,
                };
                *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner) = snapshot;
                Some(snapshot)
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(error = %e, "Status read failed, reporting cached counts");
                None
            }
        };
        let stale = fresh.is_none();
        let snapshot = fresh.unwrap_or_else(|| {
            *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
        });
        let synthesis_lag = self.store.synthesis_lag().await.ok();

        StatusReport {
            running,
            paused: self.is_paused(),
            mode,
            pool_size,
            draining,
            pending: snapshot.counts.pending,
            processing: snapshot.counts.processing,
            done: snapshot.counts.done,
            failed: snapshot.counts.failed,
            last_scan_at: snapshot.last_scan_at_ms.map(from_millis),
            backpressure: self.gate.is_engaged(),
            synthesis_lag,
            recommended_pool_size: self.monitor.recommended(),
            stale,
            store: self.store.health(),
        }
    }

    /// Completion percentage of every item currently `processing`.
    pub async fn progress(&self) -> Result<Vec<ItemProgress>, PipelineError> {
        let items = self.store.items_in_status(ItemStatus::Processing).await?;
        Ok(items
            .into_iter()
            .map(|item| ItemProgress {
                item_id: item.id,
                claimed_at: item.claimed_at(),
                source_path: item.source_path,
                claimed_by: item.claimed_by,
                percent: item.progress_percent,
            })
            .collect())
    }

    /// Run one discovery pass immediately, outside the regular cadence.
    pub async fn scan_now(&self, mode: DiscoveryMode) -> Result<ScanReport, PipelineError> {
        let discoverer = Discoverer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            Arc::clone(&self.probe),
            self.config.discovery.clone(),
            self.work_ready.clone(),
        );
        Ok(discoverer.scan(&mode, &CancellationToken::new()).await?)
    }

    /// Run one synthesis pass immediately.
    pub async fn synthesize_now(&self) -> Result<PassReport, PipelineError> {
        Ok(self.synthesizer().run_pass().await?)
    }

    /// Events for one completed item, recomputed from its stored logs.
    pub async fn resynthesize(
        &self,
        item_id: DbId,
    ) -> Result<Option<Vec<NewPackingEvent>>, PipelineError> {
        Ok(self.synthesizer().resynthesize(item_id).await?)
    }

    fn synthesizer(&self) -> EventSynthesizer {
        EventSynthesizer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            self.config.coalesce.clone(),
            Arc::clone(&self.gate),
            self.caught_up.clone(),
        )
    }

    async fn ensure_running(&self) -> Result<(), PipelineError> {
        if self.is_running().await {
            Ok(())
        } else {
            Err(PipelineError::NotRunning)
        }
    }
}

fn publish_resize(bus: &EventBus, from: usize, to: usize, reason: &'static str) {
    if from == to {
        return;
    }
    tracing::info!(from, to, reason, "Pool resized");
    bus.publish(
        PipelineEvent::new(EVENT_POOL_RESIZED)
            .with_payload(serde_json::json!({ "from": from, "to": to, "reason": reason })),
    );
}

/// Apply the monitor's recommendation to the pool every `interval`.
async fn resize_timer(
    pool: Arc<WorkerPool>,
    monitor: ResourceMonitor,
    bus: Arc<EventBus>,
    config: watch::Receiver<PoolConfig>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let target = config.borrow().clamp_size(monitor.recommended());
                let from = pool.size().await;
                if target != from {
                    let size = pool.resize(target).await;
                    publish_resize(&bus, from, size, "load");
                }
            }
        }
    }
}
