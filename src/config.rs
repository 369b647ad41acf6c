use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{Result, ReelgateError};

/// Telegram caps a media group at ten items.
pub const MAX_SCREENSHOTS: usize = 10;

fn default_log_level() -> String {
    "debug".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default tracing level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub paths: PathsConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub screenshots: ScreenshotConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Drop folder that is watched for finished writes
    pub buffer_in: PathBuf,
    /// Destination for movie video renders
    pub edit_cache: PathBuf,
    /// Destination for trailer video and audio renders
    pub trailers_temp: PathBuf,
    /// Root of the trailer archive; approved sources land in `_DONE` below it
    pub trailers_in: PathBuf,
}

impl PathsConfig {
    /// Directory an approved trailer source is moved into.
    pub fn trailer_done_dir(&self, trailer_name: &str) -> PathBuf {
        self.trailers_in
            .join("_DONE")
            .join(format!("{}_TRL", trailer_name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Path to ffprobe binary
    pub ffprobe_path: String,
    /// Path to ffmpeg binary, used for screenshot capture
    pub ffmpeg_path: String,
    /// Path to the transcoding front end that understands `@preset` tokens
    pub transcoder_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pause after a close-write event before the file is probed
    pub settle_delay_ms: u64,
    /// Pending events buffered between the watcher and the dispatcher
    pub queue_capacity: usize,
    /// Files processed concurrently after their settle delay
    pub max_in_flight: usize,
    /// Whether long-form sources are transcoded at all
    pub process_movies: bool,
    /// Reject trailers whose audio is not all 2.0 or 5.1 instead of warning
    pub require_mixed_audio: bool,
}

impl PipelineConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotConfig {
    /// Frames per album
    pub count: usize,
    /// Start of the capture window, in seconds
    pub start_secs: f64,
    /// End of the capture window, in seconds
    pub end_secs: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Bot API base URL
    pub api_url: String,
    /// Environment variable holding the bot token
    pub token_env: String,
    /// Channel that receives status messages and albums
    pub channel_id: i64,
    /// Poll the channel for replies to status messages
    pub accept_replies: bool,
    /// Long-poll timeout for reply polling
    pub poll_timeout_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ffprobe_path: "ffprobe".to_string(),
            ffmpeg_path: "ffmpeg".to_string(),
            transcoder_path: "fflite".to_string(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2000,
            queue_capacity: 300,
            max_in_flight: 16,
            process_movies: true,
            require_mixed_audio: false,
        }
    }
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            count: 5,
            start_secs: 0.0,
            end_secs: 10.0,
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.telegram.org".to_string(),
            token_env: "TOKEN".to_string(),
            channel_id: 0,
            accept_replies: false,
            poll_timeout_secs: 10,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            paths: PathsConfig {
                buffer_in: PathBuf::from("buffer/in"),
                edit_cache: PathBuf::from("edit/cache"),
                trailers_temp: PathBuf::from("edit/trailers_temp"),
                trailers_in: PathBuf::from("in/trailers"),
            },
            media: MediaConfig::default(),
            pipeline: PipelineConfig::default(),
            screenshots: ScreenshotConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReelgateError::Config(format!("Failed to read config file: {}", e)))?;

        Ok(toml::from_str(&content)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ReelgateError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| ReelgateError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }

    /// Checks the settings the pipeline cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.paths.buffer_in.as_os_str().is_empty() {
            return Err(ReelgateError::Config("paths.buffer_in must be set".to_string()));
        }

        if self.pipeline.queue_capacity == 0 {
            return Err(ReelgateError::Config(
                "pipeline.queue_capacity must be greater than zero".to_string(),
            ));
        }

        if self.pipeline.max_in_flight == 0 {
            return Err(ReelgateError::Config(
                "pipeline.max_in_flight must be greater than zero".to_string(),
            ));
        }

        if self.screenshots.count == 0 || self.screenshots.count > MAX_SCREENSHOTS {
            return Err(ReelgateError::Config(format!(
                "screenshots.count must be between 1 and {}, got {}",
                MAX_SCREENSHOTS, self.screenshots.count
            )));
        }

        if self.screenshots.start_secs < 0.0 || self.screenshots.end_secs < self.screenshots.start_secs {
            return Err(ReelgateError::Config(format!(
                "invalid screenshot window {}..{}",
                self.screenshots.start_secs, self.screenshots.end_secs
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [paths]
            buffer_in = "/srv/buffer/in"
            edit_cache = "/srv/edit/cache"
            trailers_temp = "/srv/edit/trailers_temp"
            trailers_in = "/srv/in/trailers"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.pipeline.queue_capacity, 300);
        assert_eq!(config.pipeline.settle_delay(), Duration::from_secs(2));
        assert_eq!(config.screenshots.count, 5);
        assert_eq!(config.media.transcoder_path, "fflite");
        assert!(!config.chat.accept_replies);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_trailer_done_dir() {
        let config = Config::default();
        assert_eq!(
            config.paths.trailer_done_dir("Dune"),
            PathBuf::from("in/trailers/_DONE/Dune_TRL")
        );
    }

    #[test]
    fn test_validate_rejects_bad_screenshot_settings() {
        let mut config = Config::default();
        config.screenshots.count = 11;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.screenshots.start_secs = 20.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pipeline.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.chat.channel_id = -100123;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.chat.channel_id, -100123);
        assert_eq!(loaded.paths.buffer_in, config.paths.buffer_in);
    }

    #[test]
    fn test_malformed_file_is_toml_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[paths\nbuffer_in = ").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ReelgateError::Toml(_)));
    }
}
