//! Media probing abstraction.
//!
//! [`MediaProber`] is the seam the processing pipeline depends on. The only
//! production implementation is [`FfmpegProber`]; tests substitute fakes.

mod ffprobe;

pub use ffprobe::FfmpegProber;

use std::path::Path;

use async_trait::async_trait;
use serde::Serialize;

/// Technical metadata extracted from a media file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaProbe {
    pub duration_secs: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Codec name of the primary video stream (e.g. "h264").
    pub codec: Option<String>,
    /// Overall bitrate in bits per second.
    pub bitrate: Option<u64>,
    pub has_audio: bool,
}

/// Extracts metadata and thumbnails from media files via an external tool.
#[async_trait]
pub trait MediaProber: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the backing tool is installed. Implementations answer from a
    /// value determined once at construction.
    fn is_available(&self) -> bool;

    /// Probe `path`. Fails with [`vg_core::Error::Probe`] if the file cannot
    /// be parsed or the tool is missing.
    async fn probe(&self, path: &Path) -> vg_core::Result<MediaProbe>;

    /// Render a single JPEG frame at `seek_secs`, scaled to `width` pixels
    /// wide. Fails with [`vg_core::Error::Thumbnail`].
    async fn thumbnail(&self, path: &Path, seek_secs: f64, width: u32) -> vg_core::Result<Vec<u8>>;
}

/// Seek position for a thumbnail: the midpoint of a known duration, or
/// `fallback` when the duration is unknown or not positive.
pub fn thumbnail_seek(duration_secs: Option<f64>, fallback: f64) -> f64 {
    match duration_secs {
        Some(d) if d.is_finite() && d > 0.0 => d / 2.0,
        _ => fallback.max(0.0),
    }
}
