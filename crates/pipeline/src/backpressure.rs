//! Queue-depth backpressure between the sampler pool and the synthesizer.
//!
//! The gate engages when `pending + processing` exceeds the configured
//! limit. Once engaged it stays engaged until the synthesizer releases it
//! at the end of a pass; workers do not claim in between, even if items
//! are available. Each release bumps a counter so a worker that blocked on
//! the gate can tell a catch-up signal apart from a timed-out wait, and
//! claims one item before evaluating the gate again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use packline_db::{Store, StoreError};

#[derive(Debug, Default)]
pub struct BackpressureGate {
    engaged: AtomicBool,
    releases: AtomicU64,
}

impl BackpressureGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::Acquire)
    }

    /// Number of releases so far.
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Acquire)
    }

    /// Evaluate the gate before a claim. Returns `true` while claiming
    /// must wait.
    pub async fn check(&self, store: &Store, depth_limit: i64) -> Result<bool, StoreError> {
        if self.is_engaged() {
            return Ok(true);
        }

        let counts = store.counts().await?;
        if counts.depth() <= depth_limit {
            return Ok(false);
        }

        if !self.engaged.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                depth = counts.depth(),
                depth_limit,
                "Backpressure engaged, claims paused until synthesis catches up",
            );
        }
        Ok(true)
    }

    /// Release the gate after a synthesis pass. Returns whether it was
    /// engaged.
    pub fn release(&self) -> bool {
        self.releases.fetch_add(1, Ordering::AcqRel);
        let was_engaged = self.engaged.swap(false, Ordering::AcqRel);
        if was_engaged {
            tracing::info!("Backpressure released");
        }
        was_engaged
    }
}
