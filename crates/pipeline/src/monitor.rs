//! Resource monitor: samples host load and maintains the recommended
//! pool size.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use packline_core::pool::PoolConfig;
use packline_core::resource::{apply_delta, propose_delta, LoadSample};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A source of CPU/memory utilisation samples. Blocking.
pub trait LoadSampler: Send {
    /// `None` when sampling failed.
    fn sample(&mut self) -> Option<LoadSample>;
}

/// Host-wide load via `sysinfo`.
pub struct SystemLoadSampler {
    system: sysinfo::System,
}

impl SystemLoadSampler {
    pub fn new() -> Self {
        let mut system = sysinfo::System::new();
        // CPU usage is a delta between refreshes; prime the first one.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SystemLoadSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for SystemLoadSampler {
    fn sample(&mut self) -> Option<LoadSample> {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let cpus = self.system.cpus();
        let total_memory = self.system.total_memory();
        if cpus.is_empty() || total_memory == 0 {
            return None;
        }

        let cpu_percent = cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32;
        let memory_percent = (self.system.used_memory() as f64 / total_memory as f64 * 100.0) as f32;
        Some(LoadSample {
            cpu_percent,
            memory_percent,
        })
    }
}

/// Shared handle to a boxed sampler, usable from blocking tasks.
pub type SharedSampler = Arc<Mutex<Box<dyn LoadSampler>>>;

pub fn shared_sampler(sampler: impl LoadSampler + 'static) -> SharedSampler {
    let boxed: Box<dyn LoadSampler> = Box::new(sampler);
    Arc::new(Mutex::new(boxed))
}

/// Holds the current recommendation. Reading it never blocks or fails.
#[derive(Clone)]
pub struct ResourceMonitor {
    recommended: Arc<AtomicUsize>,
    sampler: SharedSampler,
}

impl ResourceMonitor {
    pub fn new(sampler: SharedSampler, initial: usize) -> Self {
        Self {
            recommended: Arc::new(AtomicUsize::new(initial)),
            sampler,
        }
    }

    /// Current recommended pool size.
    pub fn recommended(&self) -> usize {
        self.recommended.load(Ordering::Acquire)
    }

    /// Overwrite the recommendation (used when the pool is restarted).
    pub fn reset(&self, size: usize) {
        self.recommended.store(size, Ordering::Release);
    }

    /// Take one sample and move the recommendation by the proposed delta.
    pub async fn tick(&self, config: &PoolConfig) -> usize {
        let sample = self.sample().await;
        let delta = propose_delta(sample, &config.thresholds);
        let current = self.recommended();
        let next = apply_delta(current, delta, config.min_workers, config.max_workers);
        self.recommended.store(next, Ordering::Release);

        if next != current {
            tracing::debug!(
                cpu = sample.map(|s| s.cpu_percent),
                memory = sample.map(|s| s.memory_percent),
                from = current,
                to = next,
                "Recommended pool size changed",
            );
        }
        next
    }

    async fn sample(&self) -> Option<LoadSample> {
        let sampler = Arc::clone(&self.sampler);
        let result = tokio::task::spawn_blocking(move || {
            sampler
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .sample()
        })
        .await;
        match result {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(error = %e, "Load sampling task failed");
                None
            }
        }
    }

    /// Sample on a fixed cadence until cancelled.
    pub async fn run(
        self,
        interval: Duration,
        config: watch::Receiver<PoolConfig>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(
            interval_ms = interval.as_millis() as u64,
            "Resource monitor started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Resource monitor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let config = config.borrow().clone();
                    self.tick(&config).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<LoadSample>);

    impl LoadSampler for Fixed {
        fn sample(&mut self) -> Option<LoadSample> {
            self.0
        }
    }

    fn monitor(sample: Option<LoadSample>, initial: usize) -> ResourceMonitor {
        ResourceMonitor::new(shared_sampler(Fixed(sample)), initial)
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_workers: min,
            max_workers: max,
            ..PoolConfig::default()
        }
    }

    fn load(cpu: f32, memory: f32) -> Option<LoadSample> {
        Some(LoadSample {
            cpu_percent: cpu,
            memory_percent: memory,
        })
    }

    #[tokio::test]
    async fn idle_host_grows_to_max() {
        let m = monitor(load(20.0, 50.0), 1);
        let cfg = config(1, 3);
        assert_eq!(m.tick(&cfg).await, 2);
        assert_eq!(m.tick(&cfg).await, 3);
        assert_eq!(m.tick(&cfg).await, 3);
    }

    #[tokio::test]
    async fn busy_host_shrinks_to_floor() {
        let m = monitor(load(90.0, 50.0), 3);
        let cfg = config(1, 4);
        for _ in 0..10 {
            m.tick(&cfg).await;
        }
        assert_eq!(m.recommended(), 1);
    }

    #[tokio::test]
    async fn failed_sample_holds_steady() {
        let m = monitor(None, 2);
        assert_eq!(m.tick(&config(1, 4)).await, 2);
    }

    #[tokio::test]
    async fn moderate_load_holds_steady() {
        let m = monitor(load(50.0, 50.0), 2);
        assert_eq!(m.tick(&config(1, 4)).await, 2);
    }

    #[test]
    fn system_sampler_reports_percentages() {
        let mut sampler = SystemLoadSampler::new();
        if let Some(sample) = sampler.sample() {
            assert!((0.0..=100.0).contains(&sample.memory_percent));
            assert!(sample.cpu_percent >= 0.0);
        }
    }
}
