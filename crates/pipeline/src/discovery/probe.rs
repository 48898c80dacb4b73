//! Media probing seam between discovery and `ffprobe`.

use std::path::Path;

use async_trait::async_trait;
use packline_core::ffmpeg::{self, FfmpegError, MediaInfo};

/// Extracts duration and recording start from a media file.
#[async_trait]
pub trait MediaProbe: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, FfmpegError>;
}

/// Probes with the `ffprobe` binary on `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FfprobeProbe;

#[async_trait]
impl MediaProbe for FfprobeProbe {
    async fn probe(&self, path: &Path) -> Result<MediaInfo, FfmpegError> {
        let output = ffmpeg::probe_video(path).await?;
        Ok(ffmpeg::media_info(&output))
    }
}
