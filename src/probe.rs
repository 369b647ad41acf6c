use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, ReelgateError};

/// Stream kind as reported by ffprobe's `codec_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecType {
    Video,
    Audio,
    Other,
}

impl CodecType {
    fn from_ffprobe(value: Option<&str>) -> Self {
        match value {
            Some("video") => Self::Video,
            Some("audio") => Self::Audio,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: u32,
    pub codec_type: CodecType,
    pub codec_name: String,
    pub channels: u32,
    pub channel_layout: String,
    pub width: u32,
    pub height: u32,
    pub r_frame_rate: String,
    pub sample_aspect_ratio: String,
}

impl StreamInfo {
    /// Parsed `r_frame_rate`; `None` means the rate cannot be determined.
    pub fn frame_rate(&self) -> Option<FrameRate> {
        FrameRate::parse(&self.r_frame_rate)
    }

    /// Empty SAR counts as square pixels.
    pub fn has_square_pixels(&self) -> bool {
        self.sample_aspect_ratio.is_empty() || self.sample_aspect_ratio == "1:1"
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormatInfo {
    pub format_name: String,
    pub tags: HashMap<String, String>,
}

/// Structural snapshot of one file, valid for a single classification pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub duration: f64,
    pub format: FormatInfo,
    pub streams: Vec<StreamInfo>,
}

impl ProbeResult {
    /// First video stream, if any.
    pub fn video_stream(&self) -> Option<&StreamInfo> {
        self.streams.iter().find(|s| s.codec_type == CodecType::Video)
    }

    pub fn audio_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(|s| s.codec_type == CodecType::Audio)
    }
}

/// Frame rate parsed from ffprobe notation such as `"25/1"` or `"30000/1001"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRate(f64);

impl FrameRate {
    pub fn parse(rate: &str) -> Option<Self> {
        let rate = rate.trim();
        let value = match rate.split_once('/') {
            Some((num, den)) => {
                let num: f64 = num.trim().parse().ok()?;
                let den: f64 = den.trim().parse().ok()?;
                if den == 0.0 {
                    return None;
                }
                num / den
            }
            None => rate.parse().ok()?,
        };

        (value.is_finite() && value > 0.0).then_some(Self(value))
    }

    pub fn as_f64(self) -> f64 {
        self.0
    }

    /// Audio tempo factor that retimes this rate to `target` fps.
    pub fn tempo_factor(self, target: f64) -> f64 {
        target / self.0
    }
}

// Raw ffprobe JSON, every field optional
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
    streams: Option<Vec<FfprobeStream>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    format_name: Option<String>,
    duration: Option<String>,
    tags: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    index: Option<u32>,
    codec_type: Option<String>,
    codec_name: Option<String>,
    channels: Option<u32>,
    channel_layout: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    sample_aspect_ratio: Option<String>,
}

impl From<FfprobeStream> for StreamInfo {
    fn from(raw: FfprobeStream) -> Self {
        Self {
            index: raw.index.unwrap_or_default(),
            codec_type: CodecType::from_ffprobe(raw.codec_type.as_deref()),
            codec_name: raw.codec_name.unwrap_or_default(),
            channels: raw.channels.unwrap_or_default(),
            channel_layout: raw.channel_layout.unwrap_or_default(),
            width: raw.width.unwrap_or_default(),
            height: raw.height.unwrap_or_default(),
            r_frame_rate: raw.r_frame_rate.unwrap_or_default(),
            sample_aspect_ratio: raw.sample_aspect_ratio.unwrap_or_default(),
        }
    }
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe_output(json: &str) -> serde_json::Result<ProbeResult> {
    let raw: FfprobeOutput = serde_json::from_str(json)?;

    let (duration, format) = match raw.format {
        Some(format) => (
            format
                .duration
                .as_deref()
                .and_then(|d| d.trim().parse::<f64>().ok())
                .unwrap_or_default(),
            FormatInfo {
                format_name: format.format_name.unwrap_or_default(),
                tags: format.tags.unwrap_or_default(),
            },
        ),
        None => (0.0, FormatInfo::default()),
    };

    Ok(ProbeResult {
        duration,
        format,
        streams: raw
            .streams
            .unwrap_or_default()
            .into_iter()
            .map(StreamInfo::from)
            .collect(),
    })
}

/// Metadata source for the classifier
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeResult>;
}

/// ffprobe-backed prober
pub struct FfprobeProber {
    binary_path: String,
}

impl FfprobeProber {
    pub fn new<S: Into<String>>(binary_path: S) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<ProbeResult> {
        debug!("Probing {}", path.display());

        let output = Command::new(&self.binary_path)
            .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
            .arg(path)
            .output()
            .await
            .map_err(|e| ReelgateError::Probe {
                path: path.to_path_buf(),
                reason: format!("failed to execute {}: {}", self.binary_path, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReelgateError::Probe {
                path: path.to_path_buf(),
                reason: format!("{} exited with {}: {}", self.binary_path, output.status, stderr.trim()),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_probe_output(&stdout).map_err(|e| ReelgateError::Probe {
            path: path.to_path_buf(),
            reason: format!("unreadable ffprobe output: {}", e),
        })
    }
}
