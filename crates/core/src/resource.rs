//! Load-driven pool sizing rule.
//!
//! Pure logic: the caller samples CPU/memory and passes the snapshot in.

use serde::{Deserialize, Serialize};

/// One CPU/memory utilisation sample, both in `0.0..=100.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
}

/// Thresholds that drive the grow/shrink decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadThresholds {
    /// Grow only while CPU is below this.
    pub cpu_low: f32,
    /// Shrink when CPU is above this.
    pub cpu_high: f32,
    /// Grow only while memory is below this.
    pub memory_low: f32,
    /// Shrink when memory is above this.
    pub memory_high: f32,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            cpu_low: 30.0,
            cpu_high: 80.0,
            memory_low: 70.0,
            memory_high: 85.0,
        }
    }
}

/// Propose a worker-count delta for a load sample.
///
/// - both CPU and memory under their low marks: `+1`
/// - either over its high mark: `-1`
/// - otherwise `0`
///
/// A missing sample (sampling failed) always proposes `0`.
pub fn propose_delta(sample: Option<LoadSample>, thresholds: &LoadThresholds) -> i32 {
    let Some(sample) = sample else {
        return 0;
    };
    if sample.cpu_percent > thresholds.cpu_high || sample.memory_percent > thresholds.memory_high {
        -1
    } else if sample.cpu_percent < thresholds.cpu_low
        && sample.memory_percent < thresholds.memory_low
    {
        1
    } else {
        0
    }
}

/// Apply a delta to the current size, clamped to `[max(min, 1), max]`.
pub fn apply_delta(current: usize, delta: i32, min: usize, max: usize) -> usize {
    let floor = min.max(1);
    let ceiling = max.max(floor);
    let next = if delta >= 0 {
        current.saturating_add(delta as usize)
    } else {
        current.saturating_sub(delta.unsigned_abs() as usize)
    };
    next.clamp(floor, ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f32, mem: f32) -> Option<LoadSample> {
        Some(LoadSample {
            cpu_percent: cpu,
            memory_percent: mem,
        })
    }

    #[test]
    fn idle_host_proposes_growth() {
        assert_eq!(propose_delta(sample(20.0, 50.0), &LoadThresholds::default()), 1);
    }

    #[test]
    fn hot_cpu_proposes_shrink() {
        assert_eq!(propose_delta(sample(90.0, 10.0), &LoadThresholds::default()), -1);
    }

    #[test]
    fn high_memory_alone_proposes_shrink() {
        assert_eq!(propose_delta(sample(10.0, 90.0), &LoadThresholds::default()), -1);
    }

    #[test]
    fn moderate_load_proposes_nothing() {
        assert_eq!(propose_delta(sample(50.0, 50.0), &LoadThresholds::default()), 0);
    }

    #[test]
    fn low_cpu_but_busy_memory_proposes_nothing() {
        assert_eq!(propose_delta(sample(10.0, 75.0), &LoadThresholds::default()), 0);
    }

    #[test]
    fn failed_sample_proposes_nothing() {
        assert_eq!(propose_delta(None, &LoadThresholds::default()), 0);
    }

    #[test]
    fn growth_is_capped_at_max() {
        assert_eq!(apply_delta(4, 1, 1, 4), 4);
        assert_eq!(apply_delta(3, 1, 1, 4), 4);
    }

    #[test]
    fn shrink_is_floored_at_one() {
        assert_eq!(apply_delta(1, -1, 0, 4), 1);
        assert_eq!(apply_delta(1, -1, 1, 4), 1);
    }

    #[test]
    fn repeated_signals_stay_in_bounds() {
        let mut size = 2;
        for _ in 0..50 {
            size = apply_delta(size, 1, 2, 6);
            assert!((2..=6).contains(&size));
        }
        assert_eq!(size, 6);
        for _ in 0..50 {
            size = apply_delta(size, -1, 2, 6);
            assert!((2..=6).contains(&size));
        }
        assert_eq!(size, 2);
    }

    #[test]
    fn out_of_range_current_is_pulled_into_bounds() {
        assert_eq!(apply_delta(10, 0, 1, 4), 4);
        assert_eq!(apply_delta(0, 0, 2, 4), 2);
    }
}
