use std::path::PathBuf;

use thiserror::Error;

use crate::classify::ClassificationRejection;

#[derive(Error, Debug)]
pub enum ReelgateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Probe failed for {path}: {reason}")]
    Probe { path: PathBuf, reason: String },

    #[error("Rejected: {0}")]
    Rejected(#[from] ClassificationRejection),

    #[error("{description} failed: {reason}")]
    ExternalProcess { description: String, reason: String },

    #[error("Screenshot {index} of {count} could not be captured: {reason}")]
    Album {
        index: usize,
        count: usize,
        reason: String,
    },

    #[error("Chat API error: {0}")]
    Chat(String),

    #[error("Request error: {0}")]
    Request(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Startup error: {0}")]
    Startup(String),
}

pub type Result<T> = std::result::Result<T, ReelgateError>;
