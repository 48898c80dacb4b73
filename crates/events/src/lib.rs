//! In-process signalling for the packline pipeline.
//!
//! - [`EventBus`]: publish/subscribe hub for [`PipelineEvent`]s, backed by
//!   `tokio::sync::broadcast`.
//! - [`WakeSignal`]: lossless cross-stage wake-ups with bounded waits
//!   (discoverer to workers, workers to synthesizer, synthesizer to workers).

pub mod bus;
pub mod signal;

pub use bus::{EventBus, PipelineEvent};
pub use signal::{WakeListener, WakeSignal};
