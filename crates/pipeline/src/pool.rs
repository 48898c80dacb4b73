//! Supervisor for the sampler worker pool.
//!
//! Each worker runs as its own task with a child cancellation token. The
//! pool is resized by spawning new workers or by cancelling the newest
//! ones; cancelled workers drain (finish their current item) before they
//! disappear. A worker that exits because its claim was revoked is
//! replaced with a fresh identity, as is one that panics.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::sampler::{SamplerWorker, WorkerContext, WorkerExit};

/// How a worker task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Worker(WorkerExit),
    Panicked,
}

/// Exit notification sent by every worker task.
#[derive(Debug, Clone)]
pub struct WorkerExited {
    pub seq: u64,
    pub identity: String,
    pub reason: ExitReason,
}

/// Bookkeeping for one worker task.
struct ManagedWorker {
    identity: String,
    /// Child of the pool token.
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Workers {
    /// Keyed by spawn sequence; the newest worker has the highest key.
    active: BTreeMap<u64, ManagedWorker>,
    /// Cancelled by a shrink, still finishing their current item.
    draining: BTreeMap<u64, ManagedWorker>,
}

pub struct WorkerPool {
    ctx: WorkerContext,
    /// `{node}/{session}`; worker identities append `/w{seq}`.
    prefix: String,
    workers: Mutex<Workers>,
    next_seq: AtomicU64,
    exit_tx: mpsc::UnboundedSender<WorkerExited>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create an empty pool. The returned receiver must be handed to
    /// [`WorkerPool::supervise`].
    pub fn new(
        ctx: WorkerContext,
        node_name: &str,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WorkerExited>) {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let session = uuid::Uuid::new_v4().simple().to_string();
        let pool = Arc::new(Self {
            ctx,
            prefix: format!("{node_name}/{}", &session[..8]),
            workers: Mutex::new(Workers::default()),
            next_seq: AtomicU64::new(1),
            exit_tx,
            cancel,
        });
        (pool, exit_rx)
    }

    /// Number of active (non-draining) workers.
    pub async fn size(&self) -> usize {
        self.workers.lock().await.active.len()
    }

    pub async fn draining(&self) -> usize {
        self.workers.lock().await.draining.len()
    }

    pub async fn identities(&self) -> Vec<String> {
        self.workers
            .lock()
            .await
            .active
            .values()
            .map(|w| w.identity.clone())
            .collect()
    }

    /// Grow or shrink to exactly `target` active workers.
    pub async fn resize(&self, target: usize) -> usize {
        let mut workers = self.workers.lock().await;
        if self.cancel.is_cancelled() {
            return workers.active.len();
        }

        while workers.active.len() < target {
            let (seq, worker) = self.spawn_worker();
            workers.active.insert(seq, worker);
        }
        while workers.active.len() > target {
            let Some((seq, worker)) = workers.active.pop_last() else {
                break;
            };
            tracing::info!(worker = %worker.identity, "Draining worker");
            worker.cancel.cancel();
            workers.draining.insert(seq, worker);
        }
        workers.active.len()
    }

    /// Consume exit notifications until the pool is cancelled.
    pub async fn supervise(self: Arc<Self>, mut exits: mpsc::UnboundedReceiver<WorkerExited>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                exited = exits.recv() => match exited {
                    Some(exited) => self.handle_exit(exited).await,
                    None => break,
                },
            }
        }
        tracing::debug!("Worker supervisor stopped");
    }

    async fn handle_exit(&self, exited: WorkerExited) {
        let mut workers = self.workers.lock().await;
        if workers.draining.remove(&exited.seq).is_some() {
            tracing::debug!(worker = %exited.identity, "Drained worker exited");
            return;
        }
        if workers.active.remove(&exited.seq).is_none() {
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }

        match exited.reason {
            ExitReason::Worker(WorkerExit::ClaimLost { item_id }) => {
                tracing::warn!(worker = %exited.identity, item_id, "Replacing worker after lost claim");
            }
            ExitReason::Panicked => {
                tracing::error!(worker = %exited.identity, "Worker panicked, replacing");
            }
            ExitReason::Worker(WorkerExit::Cancelled) => return,
        }
        let (seq, worker) = self.spawn_worker();
        workers.active.insert(seq, worker);
    }

    /// Cancel every worker and wait up to `timeout` for in-flight items to
    /// finish. Workers still running after that are detached; their claims
    /// are recovered by the stale-job sweep. Returns `true` on a clean stop.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().await;
            let active = std::mem::take(&mut workers.active);
            let draining = std::mem::take(&mut workers.draining);
            active
                .into_values()
                .chain(draining.into_values())
                .map(|w| {
                    w.cancel.cancel();
                    w.handle
                })
                .collect()
        };

        let count = handles.len();
        tracing::info!(workers = count, "Waiting for workers to finish current items");
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!(
                    workers = count,
                    timeout_secs = timeout.as_secs(),
                    "Workers did not stop in time, detaching",
                );
                false
            }
        }
    }

    fn spawn_worker(&self) -> (u64, ManagedWorker) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let identity = format!("{}/w{seq}", self.prefix);
        let cancel = self.cancel.child_token();
        let worker = SamplerWorker::new(identity.clone(), self.ctx.clone(), cancel.clone());
        let exit_tx = self.exit_tx.clone();
        let task_identity = identity.clone();

        let handle = tokio::spawn(async move {
            let reason = match AssertUnwindSafe(worker.run()).catch_unwind().await {
                Ok(exit) => ExitReason::Worker(exit),
                Err(_) => ExitReason::Panicked,
            };
            let _ = exit_tx.send(WorkerExited {
                seq,
                identity: task_identity,
                reason,
            });
        });

        tracing::debug!(worker = %identity, "Spawned worker");
        (
            seq,
            ManagedWorker {
                identity,
                cancel,
                handle,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;

    use futures::StreamExt;
    use packline_core::detector::{DetectRequest, DetectionStream, Detector};
    use packline_core::pool::PoolConfig;
    use packline_db::Store;
    use packline_events::{EventBus, WakeSignal};
    use tokio::sync::watch;

    use crate::backpressure::BackpressureGate;
    use crate::config::SamplerSettings;

    struct Silent;

    impl Detector for Silent {
        fn detect(&self, _request: DetectRequest) -> DetectionStream {
            futures::stream::empty().boxed()
        }
    }

    async fn context() -> WorkerContext {
        let (_tx, config) = watch::channel(PoolConfig::default());
        WorkerContext {
            store: Arc::new(Store::open_in_memory().await.unwrap()),
            bus: Arc::new(EventBus::default()),
            detector: Arc::new(Silent),
            gate: Arc::new(BackpressureGate::new()),
            work_ready: WakeSignal::new("work_ready"),
            logs_ready: WakeSignal::new("logs_ready"),
            caught_up: WakeSignal::new("caught_up"),
            paused: Arc::new(AtomicBool::new(false)),
            config,
            sampler: SamplerSettings::default(),
            wait_timeout: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn resize_grows_and_drains() {
        let (pool, exits) = WorkerPool::new(context().await, "node", CancellationToken::new());
        tokio::spawn(Arc::clone(&pool).supervise(exits));

        assert_eq!(pool.resize(3).await, 3);
        let ids: HashSet<_> = pool.identities().await.into_iter().collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| id.starts_with("node/")));

        assert_eq!(pool.resize(1).await, 1);
        assert_eq!(pool.size().await, 1);

        // Idle workers observe cancellation promptly and leave the draining set.
        for _ in 0..50 {
            if pool.draining().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pool.draining().await, 0);

        assert!(pool.shutdown(Duration::from_secs(2)).await);
        assert_eq!(pool.size().await, 0);
    }

    #[tokio::test]
    async fn cancelled_pool_does_not_grow() {
        let (pool, _exits) = WorkerPool::new(context().await, "node", CancellationToken::new());
        assert!(pool.shutdown(Duration::from_secs(1)).await);
        assert_eq!(pool.resize(4).await, 0);
    }
}
