//! Fakes and fixtures shared by the pipeline integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use packline_core::detector::{DetectRequest, DetectionRecord, DetectionStream, Detector, DetectorError};
use packline_core::ffmpeg::{FfmpegError, MediaInfo};
use packline_core::pool::PoolConfig;
use packline_core::resource::LoadSample;
use packline_db::models::queue_item::StatusCounts;
use packline_db::Store;
use packline_pipeline::config::{DiscoverySettings, SourceConfig};
use packline_pipeline::{LoadSampler, MediaProbe, PipelineConfig};
use serde_json::json;

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// What the scripted detector does for one file.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub records: Vec<DetectionRecord>,
    /// Never yield on the first attempt.
    pub hang_first: bool,
    /// Fail transiently on the first attempt.
    pub fail_first: bool,
    /// Always report corrupt media.
    pub corrupt: bool,
    /// Delay before each record.
    pub pace: Duration,
}

/// Detector driven by per-file scripts, keyed by file name.
///
/// Tracks which files have a live detection stream so tests can assert
/// that no file is ever processed by two workers at once.
#[derive(Default)]
pub struct ScriptedDetector {
    scripts: Mutex<HashMap<String, Script>>,
    attempts: Mutex<HashMap<String, usize>>,
    active: Arc<Mutex<HashSet<String>>>,
    overlaps: Arc<Mutex<Vec<String>>>,
}

struct ActiveGuard {
    name: String,
    active: Arc<Mutex<HashSet<String>>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.name);
    }
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, file_name: &str, script: Script) {
        self.scripts.lock().unwrap().insert(file_name.to_string(), script);
    }

    pub fn attempts(&self, file_name: &str) -> usize {
        self.attempts.lock().unwrap().get(file_name).copied().unwrap_or(0)
    }

    /// Files that were handed to the detector while already in flight.
    pub fn overlaps(&self) -> Vec<String> {
        self.overlaps.lock().unwrap().clone()
    }
}

impl Detector for ScriptedDetector {
    fn detect(&self, request: DetectRequest) -> DetectionStream {
        let name = file_name(&request.path);
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(name.clone()).or_default();
            *count += 1;
            *count
        };
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_else(|| Script {
                records: default_records(),
                ..Script::default()
            });

        if !self.active.lock().unwrap().insert(name.clone()) {
            self.overlaps.lock().unwrap().push(name.clone());
        }
        let guard = ActiveGuard {
            name,
            active: Arc::clone(&self.active),
        };

        let stream: DetectionStream = if script.hang_first && attempt == 1 {
            futures::stream::pending().boxed()
        } else if script.corrupt {
            futures::stream::iter(vec![Err(DetectorError::CorruptMedia("bad moov atom".into()))]).boxed()
        } else if script.fail_first && attempt == 1 {
            futures::stream::iter(vec![Err(DetectorError::Failed("detector crashed".into()))]).boxed()
        } else {
            let pace = script.pace;
            futures::stream::iter(script.records)
                .then(move |record| async move {
                    if !pace.is_zero() {
                        tokio::time::sleep(pace).await;
                    }
                    Ok(record)
                })
                .boxed()
        };

        stream
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed()
    }
}

/// Enough detections, close enough together, for one event with the
/// default coalescing thresholds.
pub fn default_records() -> Vec<DetectionRecord> {
    vec![
        DetectionRecord::new(1_000, json!({ "code": "ORD-1" })),
        DetectionRecord::new(2_000, json!({})),
        DetectionRecord::new(3_500, json!({ "code": "ORD-2" })),
        DetectionRecord::new(5_000, json!({})),
    ]
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Probe and load
// ---------------------------------------------------------------------------

/// Reports a fixed duration and no creation time (recording start falls
/// back to the file's mtime).
pub struct FixedProbe {
    pub duration_ms: Option<i64>,
}

#[async_trait]
impl MediaProbe for FixedProbe {
    async fn probe(&self, _path: &Path) -> Result<MediaInfo, FfmpegError> {
        Ok(MediaInfo {
            duration_ms: self.duration_ms,
            created_at: None,
        })
    }
}

pub struct FixedLoad(pub Option<LoadSample>);

impl LoadSampler for FixedLoad {
    fn sample(&mut self) -> Option<LoadSample> {
        self.0
    }
}

/// Load inside both dead bands: the recommendation never moves.
pub fn steady_load() -> FixedLoad {
    FixedLoad(Some(LoadSample {
        cpu_percent: 50.0,
        memory_percent: 50.0,
    }))
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Create `count` small recordings named `clip_00.mp4`, `clip_01.mp4`, …
pub fn write_clips(dir: &Path, count: usize) -> Vec<PathBuf> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("clip_{i:02}.mp4"));
            std::fs::write(&path, format!("frame data {i}")).unwrap();
            path
        })
        .collect()
}

/// A fast configuration watching `root` as camera `dock`.
pub fn test_config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        node_name: "test".to_string(),
        pool: PoolConfig {
            initial_workers: 2,
            min_workers: 1,
            max_workers: 4,
            scan_interval: Duration::from_secs(60),
            item_timeout: Duration::from_secs(30),
            reclaim_interval: Duration::from_millis(100),
            ..PoolConfig::default()
        },
        discovery: DiscoverySettings {
            sources: vec![SourceConfig {
                camera_id: "dock".to_string(),
                root: root.to_path_buf(),
            }],
            ..DiscoverySettings::default()
        },
        wait_timeout: Duration::from_millis(50),
        monitor_interval: Duration::from_millis(200),
        resize_interval: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(5),
        ..PipelineConfig::default()
    }
}

pub async fn memory_store() -> Arc<Store> {
    Arc::new(Store::open_in_memory().await.unwrap())
}

/// Poll the queue counts until `check` holds or `timeout` elapses.
pub async fn wait_for_counts<F>(store: &Store, timeout: Duration, check: F) -> bool
where
    F: Fn(&StatusCounts) -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Ok(counts) = store.counts().await {
            if check(&counts) {
                return true;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
