// Media tool invocations
//
// - commands: MediaCommand and the builder for movie, trailer and screenshot commands
// - processor: Transcoder backed by child processes

pub mod commands;
pub mod processor;

use async_trait::async_trait;

pub use commands::*;
pub use processor::*;

use crate::error::Result;

/// Opaque transcode capability
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Run one transcode to completion
    async fn run(&self, command: &MediaCommand) -> Result<()>;
}
