//! Trailer/movie classification over probed metadata.
//!
//! Path rules (tagged names, excluded extensions) need no I/O and run before a
//! file is probed; the remaining gates need a [`ProbeResult`].

use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::warn;

use crate::probe::{FrameRate, ProbeResult, StreamInfo};

/// Trailers are strictly shorter than this.
pub const TRAILER_MAX_DURATION_SECS: f64 = 360.0;
/// Trailers are at most this large.
pub const TRAILER_MAX_SIZE_BYTES: u64 = 6_000_000_000;
pub const MIN_TRAILER_WIDTH: u32 = 1920;
pub const MIN_TRAILER_HEIGHT: u32 = 1080;

/// Extensions that never trigger processing. The empty string covers files
/// without an extension.
pub const EXCLUDED_EXTENSIONS: &[&str] = &[
    "", "stl", "srt", "txt", "xml", "exe", "wav", "ac3", "m4a", "zip", "tar",
];

static TAGGED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<name>.*?)(_s(?P<season>\d{2}))?(e(?P<episode>\d{2,4}))?_(?P<type>MOV|SER|SPO)_(?P<id>\d*)(\.RUS)?(_R(?P<replace>\d))?(\.RUS)?\.(?P<ext>srt|mp4)$",
    )
    .expect("tagged name pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetCategory {
    Trailer,
    Movie,
    Ineligible,
}

impl fmt::Display for AssetCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trailer => "trailer",
            Self::Movie => "movie",
            Self::Ineligible => "ineligible",
        };
        f.write_str(name)
    }
}

/// Why a probed file was turned away. Terminal for the current event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassificationRejection {
    #[error("no video stream found")]
    NoVideoStream,

    #[error("frame rate cannot be determined (r_frame_rate {0:?})")]
    UnknownFrameRate(String),

    #[error("sample aspect ratio {0} is not 1:1")]
    NonSquarePixels(String),

    #[error("{width}x{height} is below 1920x1080 and needs an upscale")]
    BelowMinimumResolution { width: u32, height: u32 },

    #[error("audio is not all 2.0 or 5.1: {0}")]
    UnmixedAudio(AudioProblem),
}

/// Why a path is skipped before probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathExclusion {
    AlreadyTagged,
    ExcludedExtension(String),
}

impl fmt::Display for PathExclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyTagged => f.write_str("name is already tagged"),
            Self::ExcludedExtension(ext) if ext.is_empty() => f.write_str("no extension"),
            Self::ExcludedExtension(ext) => write!(f, "excluded extension .{}", ext),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioProblem {
    NoAudio,
    UnsupportedLayout,
}

impl fmt::Display for AudioProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAudio => f.write_str("no audio streams"),
            Self::UnsupportedLayout => f.write_str("streams other than 2.0 or 5.1 present"),
        }
    }
}

/// Fields of an already-tagged name such as `Show_s01e02_SER_00123.mp4`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedName {
    pub name: String,
    pub season: Option<u32>,
    pub episode: Option<u32>,
    pub asset_type: String,
    pub id: String,
    pub replace: Option<u32>,
    pub russian: bool,
    pub extension: String,
}

impl TaggedName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let caps = TAGGED_NAME.captures(file_name)?;
        let number = |name: &str| caps.name(name).and_then(|m| m.as_str().parse().ok());

        Some(Self {
            name: caps["name"].to_string(),
            season: number("season"),
            episode: number("episode"),
            asset_type: caps["type"].to_string(),
            id: caps["id"].to_string(),
            replace: number("replace"),
            russian: file_name.contains(".RUS"),
            extension: caps["ext"].to_string(),
        })
    }
}

pub fn is_tagged_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| TAGGED_NAME.is_match(n))
}

/// Path-only eligibility check, safe to run before the file is settled.
pub fn path_exclusion(path: &Path) -> Option<PathExclusion> {
    if is_tagged_name(path) {
        return Some(PathExclusion::AlreadyTagged);
    }

    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    EXCLUDED_EXTENSIONS
        .contains(&ext.as_str())
        .then_some(PathExclusion::ExcludedExtension(ext))
}

pub fn is_trailer_sized(duration: f64, size_bytes: u64) -> bool {
    duration < TRAILER_MAX_DURATION_SECS && size_bytes <= TRAILER_MAX_SIZE_BYTES
}

/// `Ok(())` when every audio stream is 2.0 or 5.1 and at least one exists.
pub fn check_audio(probe: &ProbeResult) -> Result<(), AudioProblem> {
    let mut count = 0;
    for stream in probe.audio_streams() {
        if stream.channels != 2 && stream.channels != 6 {
            return Err(AudioProblem::UnsupportedLayout);
        }
        count += 1;
    }

    if count == 0 {
        return Err(AudioProblem::NoAudio);
    }

    Ok(())
}

/// Channel tag used in rendered audio file names.
pub fn audio_channels_tag(stream: &StreamInfo) -> Option<&'static str> {
    match stream.channel_layout.as_str() {
        "stereo" => Some("20"),
        "5.1" => Some("51"),
        _ => match stream.channels {
            2 => Some("20"),
            6 => Some("51"),
            _ => None,
        },
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Classifier {
    /// Promote the audio warning to a rejection
    pub require_mixed_audio: bool,
}

impl Classifier {
    pub fn new(require_mixed_audio: bool) -> Self {
        Self { require_mixed_audio }
    }

    pub fn classify(
        &self,
        path: &Path,
        probe: &ProbeResult,
        size_bytes: u64,
    ) -> Result<AssetCategory, ClassificationRejection> {
        if path_exclusion(path).is_some() {
            return Ok(AssetCategory::Ineligible);
        }

        let video = probe.video_stream().ok_or(ClassificationRejection::NoVideoStream)?;

        if !is_trailer_sized(probe.duration, size_bytes) {
            return Ok(AssetCategory::Movie);
        }

        // retiming to 25 fps needs the source rate
        if FrameRate::parse(&video.r_frame_rate).is_none() {
            return Err(ClassificationRejection::UnknownFrameRate(video.r_frame_rate.clone()));
        }

        if !video.has_square_pixels() {
            return Err(ClassificationRejection::NonSquarePixels(video.sample_aspect_ratio.clone()));
        }

        if video.width < MIN_TRAILER_WIDTH && video.height < MIN_TRAILER_HEIGHT {
            return Err(ClassificationRejection::BelowMinimumResolution {
                width: video.width,
                height: video.height,
            });
        }

        if let Err(problem) = check_audio(probe) {
            if self.require_mixed_audio {
                return Err(ClassificationRejection::UnmixedAudio(problem));
            }
            warn!(path = %path.display(), "Trailer audio check: {}", problem);
        }

        Ok(AssetCategory::Trailer)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::probe::{CodecType, FormatInfo};

    pub(crate) fn video(width: u32, height: u32, rate: &str, sar: &str) -> StreamInfo {
        StreamInfo {
            index: 0,
            codec_type: CodecType::Video,
            codec_name: "h264".to_string(),
            channels: 0,
            channel_layout: String::new(),
            width,
            height,
            r_frame_rate: rate.to_string(),
            sample_aspect_ratio: sar.to_string(),
        }
    }

    pub(crate) fn audio(index: u32, channels: u32, layout: &str) -> StreamInfo {
        StreamInfo {
            index,
            codec_type: CodecType::Audio,
            codec_name: "aac".to_string(),
            channels,
            channel_layout: layout.to_string(),
            width: 0,
            height: 0,
            r_frame_rate: "0/0".to_string(),
            sample_aspect_ratio: String::new(),
        }
    }

    pub(crate) fn trailer_probe() -> ProbeResult {
        ProbeResult {
            duration: 200.0,
            format: FormatInfo::default(),
            streams: vec![
                video(1920, 1080, "25/1", "1:1"),
                audio(1, 2, "stereo"),
                audio(2, 6, "5.1(side)"),
            ],
        }
    }

    const TRAILER_SIZE: u64 = 4_800_000_000;

    fn classify(name: &str, probe: &ProbeResult, size: u64) -> Result<AssetCategory, ClassificationRejection> {
        Classifier::default().classify(Path::new(name), probe, size)
    }

    #[test]
    fn test_tagged_names_are_ineligible() {
        let probe = trailer_probe();
        for name in [
            "/in/X_s01e02_SER_00123.mp4",
            "/in/Film_MOV_42.mp4",
            "/in/Match_SPO_7.RUS.srt",
            "/in/Show_s02e115_SER_9_R2.RUS.mp4",
        ] {
            assert_eq!(classify(name, &probe, TRAILER_SIZE), Ok(AssetCategory::Ineligible), "{}", name);
        }
    }

    #[test]
    fn test_tagged_name_fields() {
        let tagged = TaggedName::parse("X_s01e02_SER_00123.mp4").unwrap();
        assert_eq!(tagged.name, "X");
        assert_eq!(tagged.season, Some(1));
        assert_eq!(tagged.episode, Some(2));
        assert_eq!(tagged.asset_type, "SER");
        assert_eq!(tagged.id, "00123");
        assert_eq!(tagged.replace, None);

        assert!(TaggedName::parse("X_s01e02_TRL_00123.mp4").is_none());
        assert!(TaggedName::parse("X_SER_00123.mkv").is_none());
    }

    #[test]
    fn test_excluded_extensions() {
        assert_eq!(
            path_exclusion(Path::new("/in/notes.TXT")),
            Some(PathExclusion::ExcludedExtension("txt".to_string()))
        );
        assert_eq!(
            path_exclusion(Path::new("/in/README")),
            Some(PathExclusion::ExcludedExtension(String::new()))
        );
        assert!(path_exclusion(Path::new("/in/mix.M4A")).is_some());
        assert_eq!(path_exclusion(Path::new("/in/trailer.mov")), None);
        assert_eq!(classify("/in/sub.srt", &trailer_probe(), 10), Ok(AssetCategory::Ineligible));
    }

    #[test]
    fn test_trailer_scenario() {
        let probe = trailer_probe();
        assert_eq!(classify("/in/Dune.mp4", &probe, TRAILER_SIZE), Ok(AssetCategory::Trailer));
    }

    #[test]
    fn test_duration_and_size_bounds() {
        let mut probe = trailer_probe();

        probe.duration = 359.99;
        assert_eq!(classify("/in/a.mp4", &probe, TRAILER_MAX_SIZE_BYTES), Ok(AssetCategory::Trailer));

        assert_eq!(classify("/in/a.mp4", &probe, TRAILER_MAX_SIZE_BYTES + 1), Ok(AssetCategory::Movie));

        probe.duration = 360.0;
        assert_eq!(classify("/in/a.mp4", &probe, 1_000), Ok(AssetCategory::Movie));

        probe.duration = 9000.0;
        assert_eq!(classify("/in/a.mp4", &probe, 1_000), Ok(AssetCategory::Movie));
        assert_eq!(classify("/in/a.mp4", &probe, 60_000_000_000), Ok(AssetCategory::Movie));
    }

    #[test]
    fn test_movie_path_skips_trailer_gates() {
        let mut probe = trailer_probe();
        probe.duration = 9000.0;
        probe.streams[0] = video(720, 576, "", "16:15");
        assert_eq!(classify("/in/film.mkv", &probe, 1_000), Ok(AssetCategory::Movie));
    }

    #[test]
    fn test_no_video_stream_is_rejected() {
        let mut probe = trailer_probe();
        probe.streams.remove(0);
        assert_eq!(
            classify("/in/a.mp4", &probe, TRAILER_SIZE),
            Err(ClassificationRejection::NoVideoStream)
        );

        probe.duration = 9000.0;
        assert_eq!(classify("/in/a.mp4", &probe, TRAILER_SIZE), Err(ClassificationRejection::NoVideoStream));
    }

    #[test]
    fn test_trailer_frame_rate_gate() {
        let mut probe = trailer_probe();
        probe.streams[0] = video(1920, 1080, "", "1:1");
        assert_eq!(
            classify("/in/a.mp4", &probe, TRAILER_SIZE),
            Err(ClassificationRejection::UnknownFrameRate(String::new()))
        );
    }

    #[test]
    fn test_trailer_sar_gate() {
        let mut probe = trailer_probe();
        probe.streams[0] = video(1920, 1080, "24000/1001", "");
        assert_eq!(classify("/in/a.mp4", &probe, TRAILER_SIZE), Ok(AssetCategory::Trailer));

        probe.streams[0] = video(1920, 1080, "25/1", "64:45");
        assert_eq!(
            classify("/in/a.mp4", &probe, TRAILER_SIZE),
            Err(ClassificationRejection::NonSquarePixels("64:45".to_string()))
        );
    }

    #[test]
    fn test_resolution_gate_requires_both_dimensions_below_floor() {
        let mut probe = trailer_probe();

        probe.streams[0] = video(1280, 720, "25/1", "1:1");
        assert_eq!(
            classify("/in/a.mp4", &probe, TRAILER_SIZE),
            Err(ClassificationRejection::BelowMinimumResolution { width: 1280, height: 720 })
        );

        // only one side below the floor passes
        probe.streams[0] = video(1920, 800, "25/1", "1:1");
        assert_eq!(classify("/in/a.mp4", &probe, TRAILER_SIZE), Ok(AssetCategory::Trailer));
        probe.streams[0] = video(1440, 1080, "25/1", "1:1");
        assert_eq!(classify("/in/a.mp4", &probe, TRAILER_SIZE), Ok(AssetCategory::Trailer));
    }

    #[test]
    fn test_audio_check_warns_by_default() {
        let mut probe = trailer_probe();
        probe.streams.push(audio(3, 1, "mono"));
        assert_eq!(check_audio(&probe), Err(AudioProblem::UnsupportedLayout));
        assert_eq!(classify("/in/a.mp4", &probe, TRAILER_SIZE), Ok(AssetCategory::Trailer));

        let strict = Classifier::new(true);
        assert_eq!(
            strict.classify(Path::new("/in/a.mp4"), &probe, TRAILER_SIZE),
            Err(ClassificationRejection::UnmixedAudio(AudioProblem::UnsupportedLayout))
        );

        probe.streams.truncate(1);
        assert_eq!(check_audio(&probe), Err(AudioProblem::NoAudio));
        assert_eq!(classify("/in/a.mp4", &probe, TRAILER_SIZE), Ok(AssetCategory::Trailer));
    }

    #[test]
    fn test_audio_channels_tag() {
        assert_eq!(audio_channels_tag(&audio(1, 2, "stereo")), Some("20"));
        assert_eq!(audio_channels_tag(&audio(1, 6, "5.1")), Some("51"));
        assert_eq!(audio_channels_tag(&audio(1, 6, "5.1(side)")), Some("51"));
        assert_eq!(audio_channels_tag(&audio(1, 2, "")), Some("20"));
        assert_eq!(audio_channels_tag(&audio(1, 8, "7.1")), None);
    }
}
