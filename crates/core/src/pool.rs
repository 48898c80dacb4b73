//! Scheduler-owned pool configuration and its validation.
//!
//! The Coordinator is the only writer of [`PoolConfig`]; every other actor
//! reads a published snapshot.

use std::time::Duration;

use crate::error::CoreError;
use crate::resource::LoadThresholds;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default per-item processing timeout before a claim is considered stale.
pub const DEFAULT_ITEM_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Default interval between stale-job sweeps.
pub const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(60);

/// Default interval between discovery passes.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(300);

/// Upper bound on workers accepted by validation.
const MAX_POOL_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// PoolConfig
// ---------------------------------------------------------------------------

/// Mutable scheduler state: pool bounds, thresholds and timings.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Worker count the pool starts with.
    pub initial_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub thresholds: LoadThresholds,
    pub scan_interval: Duration,
    /// A `processing` claim older than this is reclaimed.
    pub item_timeout: Duration,
    pub reclaim_interval: Duration,
    /// `pending + processing` above this engages backpressure.
    pub queue_depth_limit: i64,
    /// Retries granted to transient detector failures.
    pub max_retries: i64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_workers: 2,
            min_workers: 1,
            max_workers: 4,
            thresholds: LoadThresholds::default(),
            scan_interval: DEFAULT_SCAN_INTERVAL,
            item_timeout: DEFAULT_ITEM_TIMEOUT,
            reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
            queue_depth_limit: 500,
            max_retries: 3,
        }
    }
}

impl PoolConfig {
    /// Clamp a requested pool size to `[max(min, 1), max]`.
    pub fn clamp_size(&self, requested: usize) -> usize {
        let floor = self.min_workers.max(1);
        requested.clamp(floor, self.max_workers.max(floor))
    }

    /// Validate bounds, thresholds and timings.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_workers == 0 || self.max_workers > MAX_POOL_SIZE {
            return Err(CoreError::Validation(format!(
                "max_workers must be between 1 and {MAX_POOL_SIZE}"
            )));
        }
        if self.min_workers > self.max_workers {
            return Err(CoreError::Validation(
                "min_workers must not exceed max_workers".to_string(),
            ));
        }
        if self.initial_workers > self.max_workers {
            return Err(CoreError::Validation(
                "initial_workers must not exceed max_workers".to_string(),
            ));
        }
        validate_thresholds(&self.thresholds)?;
        if self.item_timeout.is_zero() {
            return Err(CoreError::Validation(
                "item_timeout must be greater than zero".to_string(),
            ));
        }
        if self.reclaim_interval.is_zero() || self.scan_interval.is_zero() {
            return Err(CoreError::Validation(
                "scan_interval and reclaim_interval must be greater than zero".to_string(),
            ));
        }
        if self.queue_depth_limit < 1 {
            return Err(CoreError::Validation(
                "queue_depth_limit must be at least 1".to_string(),
            ));
        }
        if self.max_retries < 0 {
            return Err(CoreError::Validation(
                "max_retries must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validate that each low/high pair is ordered and within `0..=100`.
pub fn validate_thresholds(t: &LoadThresholds) -> Result<(), CoreError> {
    let pairs = [("cpu", t.cpu_low, t.cpu_high), ("memory", t.memory_low, t.memory_high)];
    for (name, low, high) in pairs {
        if !(0.0..=100.0).contains(&low) || !(0.0..=100.0).contains(&high) {
            return Err(CoreError::Validation(format!(
                "{name} thresholds must be within 0..=100"
            )));
        }
        if low >= high {
            return Err(CoreError::Validation(format!(
                "{name} low threshold must be below its high threshold"
            )));
        }
    }
    Ok(())
}
