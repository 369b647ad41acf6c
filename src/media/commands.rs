use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, ReelgateError};

/// Target frame rate for every render.
pub const OUTPUT_FPS: u32 = 25;

const MOVIE_VIDEO_FILTER: &str = "scale=1920:-2,pad=1920:1080:-1:-1,setsar=1/1";
const TRAILER_VIDEO_FILTER: &str =
    "scale='if(gte(dar, 16/9), 1920, -2):if(gte(dar, 16/9), -2, 1080)',setsar=1/1,pad=1920:1080:-1:-1";
const SCREENSHOT_FILTER: &str = "scale=iw*sar:ih,setsar=1/1";

/// External media tool invocation
#[derive(Debug, Clone, PartialEq)]
pub struct MediaCommand {
    pub binary_path: String,
    pub args: Vec<String>,
    pub description: String,
}

impl MediaCommand {
    /// Create a new media processing command
    pub fn new<S1: Into<String>, S2: Into<String>>(binary_path: S1, description: S2) -> Self {
        Self {
            binary_path: binary_path.into(),
            args: Vec::new(),
            description: description.into(),
        }
    }

    /// Add an argument
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(|s| s.into()));
        self
    }

    /// Add input file
    pub fn input<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg("-i").arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Add output file
    pub fn output<P: AsRef<Path>>(self, path: P) -> Self {
        self.arg(path.as_ref().to_string_lossy().to_string())
    }

    /// Never overwrite existing outputs
    pub fn no_overwrite(self) -> Self {
        self.arg("-n")
    }

    pub fn hide_banner(self) -> Self {
        self.arg("-hide_banner")
    }

    /// Force the output frame rate
    pub fn frame_rate(self, fps: u32) -> Self {
        self.arg("-r").arg(fps.to_string())
    }

    /// Seek the input to `seconds`
    pub fn seek(self, seconds: f64) -> Self {
        self.arg("-ss").arg(format!("{:.3}", seconds))
    }

    /// Select an input stream for the next output
    pub fn map<S: Into<String>>(self, spec: S) -> Self {
        self.arg("-map").arg(spec)
    }

    /// Named encoder profile of the transcoding front end, e.g. `crf16`
    pub fn preset(self, name: &str) -> Self {
        self.arg(format!("@{}", name))
    }

    /// Set audio codec
    pub fn audio_codec<S: Into<String>>(self, codec: S) -> Self {
        self.arg("-c:a").arg(codec)
    }

    /// Copy audio stream
    pub fn copy_audio(self) -> Self {
        self.audio_codec("copy")
    }

    /// Add video filter
    pub fn video_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-vf").arg(filter)
    }

    /// Add audio filter
    pub fn audio_filter<S: Into<String>>(self, filter: S) -> Self {
        self.arg("-af").arg(filter)
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    /// Execute the command
    pub async fn execute(&self) -> Result<()> {
        self.execute_capture().await.map(|_| ())
    }

    /// Execute the command and return everything it wrote to stdout
    pub async fn execute_capture(&self) -> Result<Vec<u8>> {
        debug!("Executing media command: {} {:?}", self.binary_path, self.args);
        debug!("Description: {}", self.description);

        let output = self.command()
            .output()
            .await
            .map_err(|e| ReelgateError::ExternalProcess {
                description: self.description.clone(),
                reason: format!("failed to execute {}: {}", self.binary_path, e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ReelgateError::ExternalProcess {
                description: self.description.clone(),
                reason: format!("{}: {}", output.status, stderr.trim()),
            });
        }

        Ok(output.stdout)
    }
}

/// Outputs of a movie render.
#[derive(Debug, Clone, PartialEq)]
pub struct MovieOutputs {
    pub video: PathBuf,
    pub audio: PathBuf,
}

/// Outputs of a trailer render.
#[derive(Debug, Clone, PartialEq)]
pub struct TrailerOutputs {
    pub video: PathBuf,
    pub audio: PathBuf,
}

/// Builder for the pipeline's media commands
pub struct MediaCommandBuilder {
    transcoder_path: String,
    ffmpeg_path: String,
}

impl MediaCommandBuilder {
    pub fn new<S1: Into<String>, S2: Into<String>>(transcoder_path: S1, ffmpeg_path: S2) -> Self {
        Self {
            transcoder_path: transcoder_path.into(),
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    pub fn movie_outputs(source: &Path, edit_cache: &Path, buffer_in: &Path) -> MovieOutputs {
        let stem = file_stem(source);
        let ext = source
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        MovieOutputs {
            video: edit_cache.join(format!("{}_HD.mp4", stem)),
            audio: buffer_in.join(format!("{}_AUDIO{}", stem, ext)),
        }
    }

    pub fn trailer_outputs(name: &str, channels_tag: &str, trailers_temp: &Path) -> TrailerOutputs {
        TrailerOutputs {
            video: trailers_temp.join(format!("{}_TRL_HD.mp4", name)),
            audio: trailers_temp.join(format!("{}_TRL_AUDIORUS{}.m4a", name, channels_tag)),
        }
    }

    /// HD video render plus a copy of every audio stream.
    pub fn movie(&self, source: &Path, outputs: &MovieOutputs) -> MediaCommand {
        MediaCommand::new(&self.transcoder_path, "Movie transcode")
            .no_overwrite()
            .frame_rate(OUTPUT_FPS)
            .input(source)
            .map("0:v:0")
            .preset("crf16")
            .video_filter(MOVIE_VIDEO_FILTER)
            .output(&outputs.video)
            .map("0:a?")
            .copy_audio()
            .output(&outputs.audio)
    }

    /// HD video render plus one audio stream retimed from `tempo` to 25 fps.
    pub fn trailer(
        &self,
        source: &Path,
        audio_stream: usize,
        tempo: f64,
        outputs: &TrailerOutputs,
    ) -> MediaCommand {
        MediaCommand::new(&self.transcoder_path, "Trailer transcode")
            .no_overwrite()
            .frame_rate(OUTPUT_FPS)
            .input(source)
            .map("0:v:0")
            .preset("crf10")
            .video_filter(TRAILER_VIDEO_FILTER)
            .output(&outputs.video)
            .map(format!("0:a:{}", audio_stream))
            .preset("alac0")
            .audio_filter(format!("aresample=48000,atempo={:.6}", tempo))
            .output(&outputs.audio)
    }

    /// Single JPEG frame at `offset` seconds, written to stdout.
    pub fn screenshot(&self, source: &Path, offset: f64) -> MediaCommand {
        MediaCommand::new(&self.ffmpeg_path, "Screenshot capture")
            .hide_banner()
            .args(["-loglevel", "error"])
            .seek(offset)
            .input(source)
            .map("0:v:0")
            .video_filter(SCREENSHOT_FILTER)
            .args(["-frames:v", "1", "-q:v", "8", "-c:v", "mjpeg", "-f", "image2pipe", "pipe:1"])
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}
