//! Container probing and still-frame extraction via the ffmpeg toolchain.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;

/// Fixed output resolution of extracted frames.
pub const FRAME_WIDTH: u32 = 1280;
pub const FRAME_HEIGHT: u32 = 720;

/// Timestamp used when no specific frame (or only the first) is requested.
const DEFAULT_FRAME_SECS: f64 = 1.0;

/// Container metadata needed by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    pub duration_secs: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub total_frames: i64,
}

/// Seek position inside a video, rendered as `HH:MM:SS.mmm`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct FrameTimestamp(f64);

impl FrameTimestamp {
    pub fn from_secs(secs: f64) -> Self {
        Self(secs.max(0.0))
    }

    pub fn as_secs(self) -> f64 {
        self.0
    }
}

impl fmt::Display for FrameTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total_ms = (self.0 * 1000.0).round() as u64;
        let hours = total_ms / 3_600_000;
        let minutes = (total_ms / 60_000) % 60;
        let seconds = (total_ms / 1000) % 60;
        let millis = total_ms % 1000;
        write!(f, "{hours:02}:{minutes:02}:{seconds:02}.{millis:03}")
    }
}

/// Where to grab the representative frame for a 1-based `frame_index`.
///
/// Index 1 (or an unknown frame rate) maps to one second in; larger indices
/// map to `frame_index / fps`. The result is clamped so it never seeks past
/// the last frame of the video.
pub fn frame_timestamp(frame_index: u32, info: &VideoInfo) -> FrameTimestamp {
    let wanted = if frame_index <= 1 || info.fps <= 0.0 {
        DEFAULT_FRAME_SECS
    } else {
        f64::from(frame_index) / info.fps
    };

    let frame_interval = if info.fps > 0.0 { 1.0 / info.fps } else { 0.0 };
    let last = (info.duration_secs - frame_interval).max(0.0);
    FrameTimestamp::from_secs(wanted.min(last))
}

/// Media inspection and frame extraction.
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<VideoInfo, MediaError>;

    /// Write a single still at `at`, scaled to `width`×`height`, to `output`.
    async fn extract_frame(
        &self,
        input: &Path,
        output: &Path,
        at: FrameTimestamp,
        width: u32,
        height: u32,
    ) -> Result<(), MediaError>;
}

/// `ffprobe` / `ffmpeg` subprocess implementation.
#[derive(Debug, Clone)]
pub struct FfmpegToolkit {
    ffprobe: String,
    ffmpeg: String,
}

impl Default for FfmpegToolkit {
    fn default() -> Self {
        Self {
            ffprobe: "ffprobe".to_string(),
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

impl FfmpegToolkit {
    pub fn new(ffprobe: impl Into<String>, ffmpeg: impl Into<String>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
            ffmpeg: ffmpeg.into(),
        }
    }
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn probe(&self, path: &Path) -> Result<VideoInfo, MediaError> {
        if !path.exists() {
            return Err(MediaError::InputMissing(path.to_string_lossy().to_string()));
        }

        let output = tokio::process::Command::new(&self.ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await
            .map_err(MediaError::BinaryNotFound)?;

        if !output.status.success() {
            return Err(MediaError::ExecutionFailed {
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| MediaError::Parse(e.to_string()))?;
        video_info(&probe)
    }

    async fn extract_frame(
        &self,
        input: &Path,
        output: &Path,
        at: FrameTimestamp,
        width: u32,
        height: u32,
    ) -> Result<(), MediaError> {
        let result = tokio::process::Command::new(&self.ffmpeg)
            .args(["-y", "-v", "error", "-ss", &at.to_string(), "-i"])
            .arg(input)
            .args(["-frames:v", "1", "-s", &format!("{width}x{height}"), "-q:v", "2"])
            .arg(output)
            .output()
            .await
            .map_err(MediaError::BinaryNotFound)?;

        if !result.status.success() {
            return Err(MediaError::ExecutionFailed {
                exit_code: result.status.code(),
                stderr: String::from_utf8_lossy(&result.stderr).to_string(),
            });
        }

        // ffmpeg exits 0 without writing anything when the seek lands past the end.
        if !tokio::fs::try_exists(output).await? {
            return Err(MediaError::NoFrame(at.to_string()));
        }
        Ok(())
    }
}

// ffprobe JSON (`-print_format json -show_format -show_streams`)

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    /// e.g. "30/1" or "24000/1001"
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
    nb_frames: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn video_info(probe: &FfprobeOutput) -> Result<VideoInfo, MediaError> {
    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| MediaError::Malformed("no video stream".to_string()))?;

    let duration_secs = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(stream.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);
    if !duration_secs.is_finite() || duration_secs <= 0.0 {
        return Err(MediaError::Malformed("zero-duration video".to_string()));
    }

    let fps = [stream.avg_frame_rate.as_deref(), stream.r_frame_rate.as_deref()]
        .into_iter()
        .flatten()
        .map(parse_fraction)
        .find(|fps| *fps > 0.0)
        .unwrap_or(0.0);

    let total_frames = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<i64>().ok())
        .filter(|n| *n > 0)
        .unwrap_or_else(|| (duration_secs * fps).round() as i64);

    Ok(VideoInfo {
        duration_secs,
        fps,
        width: stream.width.unwrap_or(0),
        height: stream.height.unwrap_or(0),
        total_frames,
    })
}

/// Parse a fraction string like `"30/1"` into a float.
fn parse_fraction(s: &str) -> f64 {
    match s.split_once('/') {
        Some((num, den)) => {
            let num = num.parse::<f64>().unwrap_or(0.0);
            let den = den.parse::<f64>().unwrap_or(0.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => s.parse::<f64>().unwrap_or(0.0),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("ffprobe/ffmpeg binary not found: {0}")]
    BinaryNotFound(std::io::Error),

    #[error("ffprobe/ffmpeg execution failed (exit code {exit_code:?}): {stderr}")]
    ExecutionFailed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to parse ffprobe output: {0}")]
    Parse(String),

    #[error("malformed media: {0}")]
    Malformed(String),

    #[error("input file not found: {0}")]
    InputMissing(String),

    #[error("no frame could be extracted at {0}")]
    NoFrame(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(duration_secs: f64, fps: f64) -> VideoInfo {
        VideoInfo {
            duration_secs,
            fps,
            width: 1280,
            height: 720,
            total_frames: (duration_secs * fps) as i64,
        }
    }

    #[test]
    fn test_first_frame_defaults_to_one_second() {
        assert_eq!(frame_timestamp(1, &info(10.0, 30.0)).as_secs(), 1.0);
        assert_eq!(frame_timestamp(0, &info(10.0, 30.0)).as_secs(), 1.0);
        assert_eq!(frame_timestamp(90, &info(10.0, 0.0)).as_secs(), 1.0);
    }

    #[test]
    fn test_later_frames_use_index_over_fps() {
        let ts = frame_timestamp(90, &info(10.0, 30.0));
        assert!((ts.as_secs() - 3.0).abs() < 1e-9);
        assert_eq!(ts.to_string(), "00:00:03.000");
    }

    #[test]
    fn test_timestamp_clamped_to_last_frame() {
        let ts = frame_timestamp(10_000, &info(10.0, 25.0));
        assert!((ts.as_secs() - 9.96).abs() < 1e-9);

        let short = frame_timestamp(1, &info(0.5, 25.0));
        assert!((short.as_secs() - 0.46).abs() < 1e-9);
    }

    #[test]
    fn test_timestamp_display() {
        assert_eq!(FrameTimestamp::from_secs(3723.25).to_string(), "01:02:03.250");
        assert_eq!(FrameTimestamp::from_secs(-4.0).to_string(), "00:00:00.000");
    }

    #[test]
    fn test_parse_fraction() {
        assert_eq!(parse_fraction("30/1"), 30.0);
        assert!((parse_fraction("24000/1001") - 23.976).abs() < 0.001);
        assert_eq!(parse_fraction("0/0"), 0.0);
        assert_eq!(parse_fraction("25"), 25.0);
    }

    #[test]
    fn test_video_info_from_probe() {
        let json = r#"{
            "streams": [
                {"codec_type": "audio"},
                {"codec_type": "video", "width": 1280, "height": 720,
                 "r_frame_rate": "30/1", "avg_frame_rate": "30/1", "nb_frames": "300"}
            ],
            "format": {"duration": "10.000000"}
        }"#;
        let probe: FfprobeOutput = serde_json::from_str(json).unwrap();
        let info = video_info(&probe).unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.fps, 30.0);
        assert_eq!(info.total_frames, 300);
        assert_eq!(info.duration_secs, 10.0);
    }

    #[test]
    fn test_total_frames_estimated_without_nb_frames() {
        let json = r#"{
            "streams": [{"codec_type": "video", "r_frame_rate": "25/1", "duration": "4.0"}]
        }"#;
        let probe: FfprobeOutput = serde_json::from_str(json).unwrap();
        assert_eq!(video_info(&probe).unwrap().total_frames, 100);
    }

    #[test]
    fn test_zero_duration_is_malformed() {
        let json = r#"{
            "streams": [{"codec_type": "video", "r_frame_rate": "30/1"}],
            "format": {"duration": "0.000000"}
        }"#;
        let probe: FfprobeOutput = serde_json::from_str(json).unwrap();
        assert!(matches!(video_info(&probe), Err(MediaError::Malformed(_))));
    }

    #[test]
    fn test_audio_only_is_malformed() {
        let json = r#"{"streams": [{"codec_type": "audio"}], "format": {"duration": "3.0"}}"#;
        let probe: FfprobeOutput = serde_json::from_str(json).unwrap();
        assert!(matches!(video_info(&probe), Err(MediaError::Malformed(_))));
    }
}
