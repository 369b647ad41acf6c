//! Screenshot albums for the approval chat.
//!
//! Each frame comes from its own ffmpeg run that writes a single JPEG to its
//! stdout pipe. Frames are captured one after another, so the album is in
//! capture order, and the first failing capture aborts the whole album.

use async_trait::async_trait;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{Result, ReelgateError};
use crate::media::MediaCommandBuilder;

/// Time range, in seconds, screenshots are taken from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureWindow {
    pub start: f64,
    pub end: f64,
}

impl CaptureWindow {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// `count` evenly spaced offsets strictly inside the window, ascending.
    pub fn offsets(&self, count: usize) -> Vec<f64> {
        let span = (self.end - self.start).max(0.0);
        (1..=count)
            .map(|i| self.start + span * i as f64 / (count + 1) as f64)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Screenshot {
    /// Seek position the frame was taken at
    pub offset: f64,
    pub jpeg: Vec<u8>,
}

/// Ordered screenshots of one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Album {
    pub screenshots: Vec<Screenshot>,
}

impl Album {
    pub fn len(&self) -> usize {
        self.screenshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.screenshots.is_empty()
    }

    pub fn into_blobs(self) -> Vec<Vec<u8>> {
        self.screenshots.into_iter().map(|s| s.jpeg).collect()
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlbumSource: Send + Sync {
    /// Capture `count` frames of `path` from `window`, all or nothing.
    async fn build_album(&self, path: &Path, count: usize, window: CaptureWindow) -> Result<Album>;
}

pub struct ScreenshotAlbumBuilder {
    commands: MediaCommandBuilder,
}

impl ScreenshotAlbumBuilder {
    pub fn new(commands: MediaCommandBuilder) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl AlbumSource for ScreenshotAlbumBuilder {
    async fn build_album(&self, path: &Path, count: usize, window: CaptureWindow) -> Result<Album> {
        info!("Capturing {} screenshots of {}", count, path.display());

        let mut album = Album::default();
        for (i, offset) in window.offsets(count).into_iter().enumerate() {
            let index = i + 1;
            let fail = |reason: String| ReelgateError::Album { index, count, reason };

            let jpeg = self
                .commands
                .screenshot(path, offset)
                .execute_capture()
                .await
                .map_err(|e| fail(e.to_string()))?;

            if jpeg.is_empty() {
                return Err(fail("capture produced no image data".to_string()));
            }

            debug!("Screenshot {}/{} at {:.3}s: {} bytes", index, count, offset, jpeg.len());
            album.screenshots.push(Screenshot { offset, jpeg });
        }

        Ok(album)
    }
}
