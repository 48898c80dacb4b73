//! Contract with the external frame-level detector.
//!
//! The detector is a black box: it receives a file and a sampling
//! interval and yields detection records as it walks the file. It may
//! fail at any point, hang, or never yield at all.

use std::path::PathBuf;
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Region of interest within a frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    /// Parse `x,y,w,h`.
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<u32> = s
            .split(',')
            .map(|p| p.trim().parse().ok())
            .collect::<Option<_>>()?;
        match parts.as_slice() {
            [x, y, width, height] if *width > 0 && *height > 0 => Some(Self {
                x: *x,
                y: *y,
                width: *width,
                height: *height,
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for Roi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

/// One detection-run request.
#[derive(Debug, Clone)]
pub struct DetectRequest {
    pub path: PathBuf,
    pub frame_interval: Duration,
    pub roi: Option<Roi>,
}

/// One raw detection at a time offset within the source file.
///
/// The payload is opaque to the scheduler; only `offset_ms` and an
/// optional string `code` field are ever inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub offset_ms: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl DetectionRecord {
    pub fn new(offset_ms: i64, payload: serde_json::Value) -> Self {
        Self { offset_ms, payload }
    }

    /// The decoded `code` carried by the payload, if any.
    pub fn code(&self) -> Option<&str> {
        self.payload.get("code").and_then(|v| v.as_str())
    }
}

/// Detector failures, split by whether a retry can help.
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("corrupt or unsupported media: {0}")]
    CorruptMedia(String),

    #[error("detector failed: {0}")]
    Failed(String),
}

impl DetectorError {
    /// Map to the retry policy's failure kind.
    pub fn kind(&self) -> crate::queue::FailureKind {
        match self {
            Self::CorruptMedia(_) => crate::queue::FailureKind::Corrupt,
            Self::Failed(_) => crate::queue::FailureKind::Transient,
        }
    }
}

/// Stream of detection records for one file.
pub type DetectionStream = BoxStream<'static, Result<DetectionRecord, DetectorError>>;

/// The external detector.
///
/// Dropping the returned stream must cancel the detection run.
pub trait Detector: Send + Sync {
    fn detect(&self, request: DetectRequest) -> DetectionStream;
}
