use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Result, ReelgateError};
use super::{MediaCommand, Transcoder};

/// Runs transcode commands as child processes.
pub struct ProcessTranscoder {
    binary_path: String,
}

impl ProcessTranscoder {
    pub fn new<S: Into<String>>(binary_path: S) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Get transcoder version information
    pub async fn get_version_info(&self) -> Result<String> {
        debug!("Getting transcoder version information");

        let stdout = MediaCommand::new(&self.binary_path, "Version check")
            .arg("-version")
            .execute_capture()
            .await?;

        let version_info = String::from_utf8_lossy(&stdout);
        // first line carries the version
        let first_line = version_info.lines().next().unwrap_or("Unknown version");
        Ok(first_line.to_string())
    }
}

#[async_trait]
impl Transcoder for ProcessTranscoder {
    async fn run(&self, command: &MediaCommand) -> Result<()> {
        if command.binary_path != self.binary_path {
            return Err(ReelgateError::ExternalProcess {
                description: command.description.clone(),
                reason: format!("command targets {}, expected {}", command.binary_path, self.binary_path),
            });
        }

        info!("Running {}", command.description);
        command.execute().await?;
        info!("{} completed", command.description);
        Ok(())
    }
}
