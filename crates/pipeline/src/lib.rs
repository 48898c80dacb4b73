//! Video post-processing scheduler.
//!
//! Discovers new recordings, runs the external detector over them with a
//! load-sized pool of sampler workers, and coalesces the detections into
//! packing events. All actors share one lock-disciplined [`Store`] and
//! hand work to each other through bounded-wait wake signals.
//!
//! [`Coordinator`] is the entry point and the only control surface.
//!
//! [`Store`]: packline_db::Store

pub mod backpressure;
pub mod config;
pub mod coordinator;
pub mod detector;
pub mod discovery;
pub mod error;
pub mod monitor;
pub mod pool;
pub mod reclaimer;
pub mod sampler;
pub mod synthesizer;

pub use config::PipelineConfig;
pub use coordinator::{Coordinator, ItemProgress, StatusReport};
pub use detector::CommandDetector;
pub use discovery::probe::{FfprobeProbe, MediaProbe};
pub use discovery::{DiscoveryMode, ScanReport};
pub use error::PipelineError;
pub use monitor::{shared_sampler, LoadSampler, SystemLoadSampler};
