//! Domain logic for the packline scheduling subsystem.
//!
//! Zero internal dependencies: everything here is pure or talks only to
//! the filesystem and `ffprobe`.

pub mod backoff;
pub mod coalesce;
pub mod detector;
pub mod error;
pub mod ffmpeg;
pub mod hashing;
pub mod pipeline_events;
pub mod pool;
pub mod queue;
pub mod resource;
pub mod schedule;
pub mod types;
