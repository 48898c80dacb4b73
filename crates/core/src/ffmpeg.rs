//! FFprobe metadata extraction for discovered recordings.
//!
//! Only duration and creation time are needed by discovery; everything
//! else ffprobe reports is ignored.

use std::path::Path;

use serde::Deserialize;

use crate::types::Timestamp;

/// Error type for FFprobe operations.
#[derive(Debug, thiserror::Error)]
pub enum FfmpegError {
    #[error("ffprobe binary not found: {0}")]
    NotFound(std::io::Error),

    #[error("ffprobe execution failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse ffprobe output: {0}")]
    ParseError(String),

    #[error("video file not found: {0}")]
    VideoNotFound(String),
}

// ---------------------------------------------------------------------------
// ffprobe JSON output structures
// ---------------------------------------------------------------------------

/// Top-level ffprobe JSON output (`-print_format json -show_format -show_streams`).
#[derive(Debug, Deserialize)]
pub struct FfprobeOutput {
    #[serde(default)]
    pub streams: Vec<FfprobeStream>,
    pub format: FfprobeFormat,
}

/// A single stream from ffprobe output.
#[derive(Debug, Deserialize)]
pub struct FfprobeStream {
    pub codec_type: Option<String>,
    pub duration: Option<String>,
    pub tags: Option<FfprobeTags>,
}

/// Format-level metadata from ffprobe.
#[derive(Debug, Deserialize)]
pub struct FfprobeFormat {
    pub duration: Option<String>,
    pub format_name: Option<String>,
    pub tags: Option<FfprobeTags>,
}

/// Container/stream tags. Cameras usually write `creation_time`.
#[derive(Debug, Deserialize)]
pub struct FfprobeTags {
    pub creation_time: Option<String>,
}

/// What discovery needs from a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaInfo {
    pub duration_ms: Option<i64>,
    pub created_at: Option<Timestamp>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run `ffprobe` on a video file and return the parsed JSON output.
pub async fn probe_video(path: &Path) -> Result<FfprobeOutput, FfmpegError> {
    if !path.exists() {
        return Err(FfmpegError::VideoNotFound(
            path.to_string_lossy().to_string(),
        ));
    }

    let output = tokio::process::Command::new("ffprobe")
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ])
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(FfmpegError::NotFound)?;

    if !output.status.success() {
        return Err(FfmpegError::ExecutionFailed {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    parse_probe_output(&output.stdout)
}

/// Parse raw ffprobe JSON bytes.
pub fn parse_probe_output(stdout: &[u8]) -> Result<FfprobeOutput, FfmpegError> {
    serde_json::from_slice::<FfprobeOutput>(stdout).map_err(|e| {
        FfmpegError::ParseError(format!("{e}: {}", String::from_utf8_lossy(stdout)))
    })
}

/// Reduce ffprobe output to [`MediaInfo`].
pub fn media_info(probe: &FfprobeOutput) -> MediaInfo {
    MediaInfo {
        duration_ms: parse_duration(probe).map(|secs| (secs * 1000.0).round() as i64),
        created_at: parse_creation_time(probe),
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Find the first video stream in the ffprobe output.
fn first_video_stream(probe: &FfprobeOutput) -> Option<&FfprobeStream> {
    probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
}

/// Parse the video duration in seconds from ffprobe output.
///
/// Returns `None` when neither the format nor the first video stream
/// reports a positive duration.
pub fn parse_duration(probe: &FfprobeOutput) -> Option<f64> {
    let format = probe.format.duration.as_deref();
    let stream = first_video_stream(probe).and_then(|s| s.duration.as_deref());
    [format, stream]
        .into_iter()
        .flatten()
        .filter_map(|d| d.parse::<f64>().ok())
        .find(|secs| *secs > 0.0)
}

/// Parse the recording start from the `creation_time` tag.
///
/// Format tags win over stream tags.
pub fn parse_creation_time(probe: &FfprobeOutput) -> Option<Timestamp> {
    let format = probe.format.tags.as_ref().and_then(|t| t.creation_time.as_deref());
    let stream = first_video_stream(probe)
        .and_then(|s| s.tags.as_ref())
        .and_then(|t| t.creation_time.as_deref());
    [format, stream]
        .into_iter()
        .flatten()
        .find_map(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&chrono::Utc))
}
