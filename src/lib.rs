//! Reelgate - Drop-folder Media Ingest Pipeline
//! 
//! Watches an ingest folder, probes each finished upload with ffprobe,
//! transcodes full-length movies straight away and holds trailers for a
//! human decision taken over a chat channel with a screenshot album.

pub mod cli;
pub mod config;
pub mod error;
pub mod probe;
pub mod classify;
pub mod media;
pub mod executor;
pub mod album;
pub mod chat;
pub mod requests;
pub mod pipeline;
pub mod watch;
