//! ffprobe/ffmpeg-based [`MediaProber`] implementation.
//!
//! Probing shells out to `ffprobe -v quiet -print_format json -show_format
//! -show_streams`; thumbnails are a single `ffmpeg -ss <t> -frames:v 1` frame
//! written to a temporary file and read back.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use vg_core::config::ProcessingConfig;
use vg_core::Error;

use super::{MediaProbe, MediaProber};
use crate::command::ToolCommand;
use crate::tools::ToolRegistry;

/// A prober backed by the `ffprobe` and `ffmpeg` CLIs.
#[derive(Debug, Clone)]
pub struct FfmpegProber {
    ffprobe_path: Option<PathBuf>,
    ffmpeg_path: Option<PathBuf>,
    probe_timeout: Duration,
    thumbnail_timeout: Duration,
}

impl FfmpegProber {
    /// Build a prober from discovered tools. Missing tools make the prober
    /// report itself unavailable rather than failing construction.
    pub fn from_registry(registry: &ToolRegistry, processing: &ProcessingConfig) -> Self {
        Self {
            ffprobe_path: registry.path("ffprobe").map(Path::to_path_buf),
            ffmpeg_path: registry.path("ffmpeg").map(Path::to_path_buf),
            probe_timeout: Duration::from_secs(processing.probe_timeout_secs),
            thumbnail_timeout: Duration::from_secs(processing.thumbnail_timeout_secs),
        }
    }
}

#[async_trait]
impl MediaProber for FfmpegProber {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn is_available(&self) -> bool {
        self.ffprobe_path.is_some() && self.ffmpeg_path.is_some()
    }

    async fn probe(&self, path: &Path) -> vg_core::Result<MediaProbe> {
        let ffprobe = self
            .ffprobe_path
            .clone()
            .ok_or_else(|| Error::Probe("ffprobe is not installed".into()))?;

        let mut cmd = ToolCommand::new(ffprobe);
        cmd.args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
        ]);
        cmd.arg(path.to_string_lossy().into_owned());
        cmd.timeout(self.probe_timeout);

        let output = cmd.execute().await.map_err(|e| Error::Probe(e.to_string()))?;
        parse_ffprobe_json(&output.stdout)
    }

    async fn thumbnail(&self, path: &Path, seek_secs: f64, width: u32) -> vg_core::Result<Vec<u8>> {
        let ffmpeg = self
            .ffmpeg_path
            .clone()
            .ok_or_else(|| Error::Thumbnail("ffmpeg is not installed".into()))?;

        let dir = tempfile::tempdir().map_err(|e| Error::Thumbnail(e.to_string()))?;
        let out = dir.path().join("thumb.jpg");

        let mut cmd = ToolCommand::new(ffmpeg);
        cmd.args(["-hide_banner", "-loglevel", "error", "-y"]);
        cmd.args(["-ss".to_string(), format!("{seek_secs:.3}")]);
        cmd.arg("-i").arg(path.to_string_lossy().into_owned());
        cmd.args(["-frames:v", "1", "-vf"]);
        cmd.arg(format!("scale={width}:-2"));
        cmd.args(["-q:v", "4"]);
        cmd.arg(out.to_string_lossy().into_owned());
        cmd.timeout(self.thumbnail_timeout);

        cmd.execute()
            .await
            .map_err(|e| Error::Thumbnail(e.to_string()))?;

        let bytes = tokio::fs::read(&out)
            .await
            .map_err(|e| Error::Thumbnail(format!("ffmpeg produced no frame: {e}")))?;
        if bytes.is_empty() {
            return Err(Error::Thumbnail("ffmpeg produced an empty frame".into()));
        }
        Ok(bytes)
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    bit_rate: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Map ffprobe JSON into a [`MediaProbe`]. A file without a video stream is
/// not valid media for this pipeline.
fn parse_ffprobe_json(stdout: &str) -> vg_core::Result<MediaProbe> {
    let output: FfprobeOutput = serde_json::from_str(stdout)
        .map_err(|e| Error::Probe(format!("ffprobe JSON parse error: {e}")))?;

    let video = output
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| Error::Probe("no video stream found".into()))?;

    let has_audio = output
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    let format = output.format.as_ref();

    let duration_secs = format
        .and_then(|f| parse_num::<f64>(f.duration.as_deref()))
        .or_else(|| parse_num::<f64>(video.duration.as_deref()))
        .filter(|d| d.is_finite() && *d >= 0.0);

    let bitrate = format
        .and_then(|f| parse_num::<u64>(f.bit_rate.as_deref()))
        .or_else(|| parse_num::<u64>(video.bit_rate.as_deref()));

    Ok(MediaProbe {
        duration_secs,
        width: video.width.filter(|w| *w > 0),
        height: video.height.filter(|h| *h > 0),
        codec: video.codec_name.clone(),
        bitrate,
        has_audio,
    })
}

fn parse_num<T: std::str::FromStr>(s: Option<&str>) -> Option<T> {
    s.and_then(|v| v.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "streams": [
            {"index": 0, "codec_type": "video", "codec_name": "h264",
             "width": 1280, "height": 720, "duration": "10.000000"},
            {"index": 1, "codec_type": "audio", "codec_name": "aac",
             "channels": 2}
        ],
        "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2",
                   "duration": "10.023000", "bit_rate": "2500000"}
    }"#;

    #[test]
    fn parses_sample_output() {
        let probe = parse_ffprobe_json(SAMPLE).unwrap();
        assert_eq!(probe.width, Some(1280));
        assert_eq!(probe.height, Some(720));
        assert_eq!(probe.codec.as_deref(), Some("h264"));
        assert_eq!(probe.bitrate, Some(2_500_000));
        assert!(probe.has_audio);
        assert!((probe.duration_secs.unwrap() - 10.023).abs() < 1e-9);
    }

    #[test]
    fn falls_back_to_stream_duration() {
        let json = r#"{
            "streams": [{"codec_type": "video", "codec_name": "vp9",
                         "width": 640, "height": 360, "duration": "4.5",
                         "bit_rate": "800000"}],
            "format": {"duration": "N/A"}
        }"#;
        let probe = parse_ffprobe_json(json).unwrap();
        assert_eq!(probe.duration_secs, Some(4.5));
        assert_eq!(probe.bitrate, Some(800_000));
        assert!(!probe.has_audio);
    }

    #[test]
    fn audio_only_is_probe_error() {
        let json = r#"{"streams": [{"codec_type": "audio", "codec_name": "mp3"}],
                       "format": {"duration": "3.0"}}"#;
        let err = parse_ffprobe_json(json).unwrap_err();
        assert!(matches!(err, Error::Probe(_)));
    }

    #[test]
    fn garbage_is_probe_error() {
        assert!(matches!(parse_ffprobe_json("{}garbage"), Err(Error::Probe(_))));
        // `ffprobe -v quiet` on a non-media file prints an empty object
        assert!(matches!(parse_ffprobe_json("{}"), Err(Error::Probe(_))));
    }

    #[test]
    fn unavailable_without_tools() {
        let prober =
            FfmpegProber::from_registry(&ToolRegistry::default(), &ProcessingConfig::default());
        assert!(!prober.is_available());
    }

    #[tokio::test]
    async fn missing_tools_are_typed_errors() {
        let prober =
            FfmpegProber::from_registry(&ToolRegistry::default(), &ProcessingConfig::default());
        let path = Path::new("/nonexistent.mp4");
        assert!(matches!(prober.probe(path).await, Err(Error::Probe(_))));
        assert!(matches!(
            prober.thumbnail(path, 1.0, 320).await,
            Err(Error::Thumbnail(_))
        ));
    }
}
