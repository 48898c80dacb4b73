//! Coordinator control surface: lifecycle, pause/resume, resizing, status.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{
    memory_store, steady_load, test_config, wait_for_counts, write_clips, FixedProbe, ScriptedDetector,
};
use packline_core::detector::Detector;
use packline_core::pipeline_events::EVENT_POOL_RESIZED;
use packline_db::Store;
use packline_pipeline::{shared_sampler, Coordinator, DiscoveryMode, PipelineConfig, PipelineError};

fn coordinator(store: &Arc<Store>, config: PipelineConfig) -> Coordinator {
    let detector: Arc<dyn Detector> = Arc::new(ScriptedDetector::new());
    Coordinator::new(
        Arc::clone(store),
        detector,
        Arc::new(FixedProbe {
            duration_ms: Some(60_000),
        }),
        shared_sampler(steady_load()),
        config,
    )
    .unwrap()
}

#[tokio::test]
async fn lifecycle_errors() {
    let dir = tempfile::tempdir().unwrap();
    let store = memory_store().await;
    let coordinator = coordinator(&store, test_config(dir.path()));

    assert_matches!(coordinator.stop().await, Err(PipelineError::NotRunning));
    assert_matches!(coordinator.pause().await, Err(PipelineError::NotRunning));
    assert_matches!(coordinator.resize(2).await, Err(PipelineError::NotRunning));

    coordinator.start(DiscoveryMode::Default).await.unwrap();
    assert!(coordinator.is_running().await);
    assert_matches!(
        coordinator.start(DiscoveryMode::Default).await,
        Err(PipelineError::AlreadyRunning)
    );

    coordinator.stop().await.unwrap();
    assert!(!coordinator.is_running().await);
    assert_matches!(coordinator.stop().await, Err(PipelineError::NotRunning));

    // A stopped pipeline can be started again.
    coordinator.start(DiscoveryMode::Default).await.unwrap();
    coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = memory_store().await;
    let mut config = test_config(dir.path());
    config.pool.min_workers = 5;
    config.pool.max_workers = 2;

    let detector: Arc<dyn Detector> = Arc::new(ScriptedDetector::new());
    let result = Coordinator::new(
        store,
        detector,
        Arc::new(FixedProbe { duration_ms: None }),
        shared_sampler(steady_load()),
        config,
    );
    assert_matches!(result, Err(PipelineError::Config(_)));
}

#[tokio::test]
async fn resize_is_clamped_to_pool_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let store = memory_store().await;
    let mut config = test_config(dir.path());
    config.pool.min_workers = 1;
    config.pool.max_workers = 3;

    let coordinator = coordinator(&store, config);
    let mut events = coordinator.subscribe();
    coordinator.start(DiscoveryMode::Default).await.unwrap();
    assert_eq!(coordinator.status().await.pool_size, 2);

    for _ in 0..5 {
        assert_eq!(coordinator.resize(10).await.unwrap(), 3);
    }
    assert_eq!(coordinator.status().await.pool_size, 3);
    for _ in 0..5 {
        assert_eq!(coordinator.resize(0).await.unwrap(), 1);
    }
    assert_eq!(coordinator.status().await.pool_size, 1);

    let mut resized = 0;
    while let Ok(event) = events.try_recv() {
        if event.event_type == EVENT_POOL_RESIZED {
            resized += 1;
        }
    }
    // 2 -> 3 and 3 -> 1; repeated requests at a bound change nothing.
    assert_eq!(resized, 2);

    coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn config_update_clamps_running_pool() {
    let dir = tempfile::tempdir().unwrap();
    let store = memory_store().await;
    let coordinator = coordinator(&store, test_config(dir.path()));
    coordinator.start(DiscoveryMode::Default).await.unwrap();
    assert_eq!(coordinator.resize(4).await.unwrap(), 4);

    let mut pool = coordinator.config();
    pool.max_workers = 2;
    pool.initial_workers = 2;
    coordinator.update_config(pool).await.unwrap();
    assert_eq!(coordinator.config().max_workers, 2);
    assert_eq!(coordinator.status().await.pool_size, 2);

    let mut bad = coordinator.config();
    bad.queue_depth_limit = 0;
    assert_matches!(coordinator.update_config(bad).await, Err(PipelineError::Validation(_)));
    assert_eq!(coordinator.config().queue_depth_limit, 500);

    coordinator.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_stops_claims_until_resume() {
    let dir = tempfile::tempdir().unwrap();
    let store = memory_store().await;
    let coordinator = coordinator(&store, test_config(dir.path()));

    coordinator.start(DiscoveryMode::Default).await.unwrap();
    coordinator.pause().await.unwrap();
    assert!(coordinator.status().await.paused);
    // Let every worker observe the pause.
    tokio::time::sleep(Duration::from_millis(150)).await;

    write_clips(dir.path(), 5);
    coordinator.scan_now(DiscoveryMode::Default).await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let counts = store.counts().await.unwrap();
    assert_eq!(counts.pending, 5);
    assert_eq!(counts.processing + counts.done, 0);

    coordinator.resume().await.unwrap();
    assert!(wait_for_counts(&store, Duration::from_secs(10), |c| c.done == 5).await);
    coordinator.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn status_and_progress_report_queue_state() {
    let dir = tempfile::tempdir().unwrap();
    write_clips(dir.path(), 3);
    let store = memory_store().await;
    let coordinator = coordinator(&store, test_config(dir.path()));

    let idle = coordinator.status().await;
    assert!(!idle.running);
    assert_eq!(idle.pool_size, 0);
    assert!(idle.last_scan_at.is_none());

    coordinator.start(DiscoveryMode::Default).await.unwrap();
    assert!(wait_for_counts(&store, Duration::from_secs(10), |c| c.done == 3).await);

    let mut status = coordinator.status().await;
    for _ in 0..40 {
        if status.last_scan_at.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
        status = coordinator.status().await;
    }
    assert!(status.running);
    assert_eq!(status.mode, Some(DiscoveryMode::Default));
    assert_eq!((status.pending, status.processing, status.done, status.failed), (0, 0, 3, 0));
    assert!(status.last_scan_at.is_some());
    assert!(!status.stale);
    assert!(!status.store.degraded);
    assert!(coordinator.progress().await.unwrap().is_empty());

    coordinator.stop().await.unwrap();
}

#[tokio::test]
async fn status_survives_store_loss() {
    let dir = tempfile::tempdir().unwrap();
    write_clips(dir.path(), 2);
    let store = memory_store().await;
    let coordinator = coordinator(&store, test_config(dir.path()));
    coordinator.scan_now(DiscoveryMode::Default).await.unwrap();

    let before = coordinator.status().await;
    assert_eq!(before.pending, 2);

    store.close().await;
    let after = coordinator.status().await;
    assert!(after.stale);
    assert!(after.store.degraded);
    assert_eq!(after.pending, 2);
}
