//! Per-file approval requests.
//!
//! A trailer candidate moves through
//! `Requested → AlbumSent → AwaitingUserInput → Resolved → Transcoding → Done`,
//! and can drop to `Failed` from any non-terminal phase. Terminal phases remove
//! the entry, so a file that is written again later starts a fresh request.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::album::{AlbumSource, CaptureWindow};
use crate::chat::{ChatClient, MessageId};
use crate::config::ScreenshotConfig;
use crate::error::{Result, ReelgateError};

/// What the operator chose for a trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrailerResolution {
    /// Base name for rendered files, without the `_TRL` suffix
    pub name: String,
    /// Index among the source's audio streams
    pub audio_stream: usize,
}

impl TrailerResolution {
    /// Reads `<name> [a:<n>]` from a chat reply.
    ///
    /// Whitespace and anything that is not a letter, digit, `-`, `_` or `.`
    /// becomes `_`. Returns `None` when no usable name remains.
    pub fn parse_reply(text: &str) -> Option<Self> {
        let mut words: Vec<&str> = text.split_whitespace().collect();

        let mut audio_stream = 0;
        if let Some(index) = words
            .last()
            .and_then(|w| w.strip_prefix("a:"))
            .and_then(|n| n.parse::<usize>().ok())
        {
            audio_stream = index;
            words.pop();
        }

        let name: String = words
            .join("_")
            .chars()
            .map(|c| if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') { c } else { '_' })
            .collect();
        let name = name.trim_matches(|c| c == '_' || c == '.').to_string();

        (!name.is_empty()).then_some(Self { name, audio_stream })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestPhase {
    Requested,
    AlbumSent,
    AwaitingUserInput,
    Resolved(TrailerResolution),
    Transcoding,
    Archiving,
    Done,
    Failed(String),
}

impl RequestPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed(_))
    }

    pub fn can_advance_to(&self, next: &RequestPhase) -> bool {
        use RequestPhase::*;
        match (self, next) {
            (Requested, AlbumSent)
            | (AlbumSent, AwaitingUserInput)
            | (AwaitingUserInput, Resolved(_))
            | (Resolved(_), Transcoding)
            | (Transcoding, Archiving)
            | (Archiving, Done) => true,
            (from, Failed(_)) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RequestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("requested"),
            Self::AlbumSent => f.write_str("album sent"),
            Self::AwaitingUserInput => f.write_str("awaiting user input"),
            Self::Resolved(r) => write!(f, "resolved as {} (audio {})", r.name, r.audio_stream),
            Self::Transcoding => f.write_str("transcoding"),
            Self::Archiving => f.write_str("archiving"),
            Self::Done => f.write_str("done"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestState {
    pub id: Uuid,
    pub source_path: PathBuf,
    pub status_message: Option<MessageId>,
    pub photo_groups: Vec<MessageId>,
    pub phase: RequestPhase,
    pub created_at: DateTime<Utc>,
}

impl RequestState {
    pub fn new(source_path: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_path,
            status_message: None,
            photo_groups: Vec::new(),
            phase: RequestPhase::Requested,
            created_at: Utc::now(),
        }
    }
}

/// Mutex-guarded map of requests keyed by file name.
///
/// Every operation holds the lock for its whole duration, so two tasks can
/// never interleave updates to the same entry.
#[derive(Debug, Default)]
pub struct RequestStore {
    entries: Mutex<HashMap<String, RequestState>>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, RequestState>> {
        // a panicking writer cannot leave an entry half-updated
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a new entry; fails if `filename` already has one.
    pub fn create(&self, filename: &str, state: RequestState) -> Result<()> {
        let mut entries = self.entries();
        if let Some(existing) = entries.get(filename) {
            return Err(ReelgateError::Request(format!(
                "{} already has an open request ({})",
                filename, existing.phase
            )));
        }
        entries.insert(filename.to_string(), state);
        Ok(())
    }

    pub fn get(&self, filename: &str) -> Option<RequestState> {
        self.entries().get(filename).cloned()
    }

    /// Apply `f` to the entry under the lock.
    pub fn mutate<R>(&self, filename: &str, f: impl FnOnce(&mut RequestState) -> Result<R>) -> Result<R> {
        let mut entries = self.entries();
        let state = entries
            .get_mut(filename)
            .ok_or_else(|| ReelgateError::Request(format!("no open request for {}", filename)))?;
        f(state)
    }

    pub fn remove(&self, filename: &str) -> Option<RequestState> {
        self.entries().remove(filename)
    }

    pub fn find_by_status_message(&self, message: MessageId) -> Option<String> {
        self.entries()
            .iter()
            .find(|(_, state)| state.status_message == Some(message))
            .map(|(filename, _)| filename.clone())
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| ReelgateError::Request(format!("{} has no file name", path.display())))
}

fn status_text(filename: &str, phase: &RequestPhase) -> String {
    match phase {
        RequestPhase::Requested | RequestPhase::AlbumSent | RequestPhase::AwaitingUserInput => {
            format!("❓ {}", filename)
        }
        RequestPhase::Resolved(r) => format!("🕐 {} → {}_TRL", filename, r.name),
        RequestPhase::Transcoding => format!("🕐 {}", filename),
        RequestPhase::Archiving => format!("📤 {}", filename),
        RequestPhase::Done => format!("✅ {}", filename),
        RequestPhase::Failed(reason) => format!("❌ {}: {}", filename, reason),
    }
}

/// Drives approval requests through the chat channel.
pub struct RequestManager {
    store: Arc<RequestStore>,
    chat: Arc<dyn ChatClient>,
    albums: Arc<dyn AlbumSource>,
    screenshots: ScreenshotConfig,
}

impl RequestManager {
    pub fn new(
        store: Arc<RequestStore>,
        chat: Arc<dyn ChatClient>,
        albums: Arc<dyn AlbumSource>,
        screenshots: ScreenshotConfig,
    ) -> Self {
        Self {
            store,
            chat,
            albums,
            screenshots,
        }
    }

    pub fn store(&self) -> &Arc<RequestStore> {
        &self.store
    }

    /// Open a request for `path`, post its status line and screenshot album.
    ///
    /// Leaves the request in `AwaitingUserInput`. On failure the request is
    /// marked failed and removed.
    pub async fn request_approval(&self, path: &Path) -> Result<()> {
        let filename = file_name(path)?;
        self.store.create(&filename, RequestState::new(path.to_path_buf()))?;
        info!(file = %filename, "Approval requested");

        match self.post_request(&filename, path).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&filename, &e.to_string()).await;
                Err(e)
            }
        }
    }

    async fn post_request(&self, filename: &str, path: &Path) -> Result<()> {
        let status = self
            .chat
            .send_message(&status_text(filename, &RequestPhase::Requested))
            .await?;
        self.store.mutate(filename, |state| {
            state.status_message = Some(status);
            Ok(())
        })?;

        let window = CaptureWindow::new(self.screenshots.start_secs, self.screenshots.end_secs);
        let album = self
            .albums
            .build_album(path, self.screenshots.count, window)
            .await?;
        let photo_groups = self.chat.send_album(album.into_blobs()).await?;

        self.transition(filename, RequestPhase::AlbumSent, |state| {
            state.photo_groups.extend(photo_groups);
        })?;
        self.transition(filename, RequestPhase::AwaitingUserInput, |_| {})?;

        info!(file = %filename, "Awaiting user input");
        Ok(())
    }

    /// Record the operator's choice. Only valid while awaiting input.
    pub async fn resolve(&self, filename: &str, resolution: TrailerResolution) -> Result<RequestState> {
        let state = self.transition(filename, RequestPhase::Resolved(resolution), |_| {})?;
        self.publish_status(filename, &state).await;
        Ok(state)
    }

    pub async fn begin_transcoding(&self, filename: &str) -> Result<RequestState> {
        let state = self.transition(filename, RequestPhase::Transcoding, |_| {})?;
        self.publish_status(filename, &state).await;
        Ok(state)
    }

    /// The render finished; the source is being moved to its archive folder.
    pub async fn begin_archiving(&self, filename: &str) -> Result<RequestState> {
        let state = self.transition(filename, RequestPhase::Archiving, |_| {})?;
        self.publish_status(filename, &state).await;
        Ok(state)
    }

    /// Mark the request done and drop it.
    pub async fn complete(&self, filename: &str) -> Result<()> {
        let state = self.transition(filename, RequestPhase::Done, |_| {})?;
        self.store.remove(filename);
        self.publish_status(filename, &state).await;
        info!(file = %filename, request = %state.id, "Request completed");
        Ok(())
    }

    /// Mark the request failed and drop it. No-op for unknown or finished requests.
    pub async fn fail(&self, filename: &str, reason: &str) {
        let state = match self.transition(filename, RequestPhase::Failed(reason.to_string()), |_| {}) {
            Ok(state) => state,
            Err(e) => {
                warn!(file = %filename, "Cannot mark request failed: {}", e);
                return;
            }
        };
        self.store.remove(filename);
        warn!(file = %filename, request = %state.id, "Request failed: {}", reason);
        self.publish_status(filename, &state).await;
    }

    fn transition(
        &self,
        filename: &str,
        next: RequestPhase,
        update: impl FnOnce(&mut RequestState),
    ) -> Result<RequestState> {
        self.store.mutate(filename, |state| {
            if !state.phase.can_advance_to(&next) {
                return Err(ReelgateError::Request(format!(
                    "{}: cannot move from {} to {}",
                    filename, state.phase, next
                )));
            }
            update(state);
            state.phase = next;
            Ok(state.clone())
        })
    }

    /// Best-effort edit of the status line.
    async fn publish_status(&self, filename: &str, state: &RequestState) {
        let Some(message) = state.status_message else {
            return;
        };
        if let Err(e) = self
            .chat
            .edit_message(message, &status_text(filename, &state.phase))
            .await
        {
            warn!(file = %filename, "Failed to update status message: {}", e);
        }
    }
}
