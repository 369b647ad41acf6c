//! Drop-folder watcher and event dispatcher.
//!
//! The notify callback pushes close-after-write events into a bounded queue.
//! A single loop drains the queue in arrival order, filters paths, drops
//! duplicates of files that are already in flight and hands every remaining
//! file to its own supervised task.

use async_trait::async_trait;
use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::classify::path_exclusion;
use crate::error::{Result, ReelgateError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// A writer closed the file
    WriteCompleted,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

impl FileEvent {
    pub fn write_completed<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            kind: FileEventKind::WriteCompleted,
        }
    }

    /// Expand a notify event into one `FileEvent` per path.
    pub fn from_notify(event: Event) -> Vec<Self> {
        let kind = match event.kind {
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => FileEventKind::WriteCompleted,
            _ => FileEventKind::Other,
        };
        event.paths.into_iter().map(|path| Self { path, kind }).collect()
    }
}

/// Per-file work run by the dispatcher
#[async_trait]
pub trait FileHandler: Send + Sync {
    async fn handle(&self, path: &Path) -> Result<()>;
}

/// Keeps the OS watch alive; events stop when this is dropped.
pub struct DropFolderWatcher {
    _watcher: RecommendedWatcher,
}

impl DropFolderWatcher {
    /// Watch `dir` (non-recursively) and return the receiving end of the
    /// event queue. Events arriving while the queue is full are dropped.
    pub fn start(dir: &Path, capacity: usize) -> Result<(Self, mpsc::Receiver<FileEvent>)> {
        if !dir.is_dir() {
            return Err(ReelgateError::Startup(format!(
                "watch directory {} does not exist",
                dir.display()
            )));
        }

        let (tx, rx) = mpsc::channel(capacity);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for file_event in FileEvent::from_notify(event) {
                    forward(&tx, file_event);
                }
            }
            Err(e) => error!("Watch error: {}", e),
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        info!("Watching {} (queue capacity {})", dir.display(), capacity);
        Ok((Self { _watcher: watcher }, rx))
    }
}

/// Queue a close-after-write event without blocking the watcher thread.
///
/// Returns whether the event was queued; a full or closed queue drops it.
fn forward(tx: &mpsc::Sender<FileEvent>, event: FileEvent) -> bool {
    if event.kind != FileEventKind::WriteCompleted {
        return false;
    }

    match tx.try_send(event) {
        Ok(()) => true,
        Err(e) => {
            warn!("Event queue rejected an event: {}", e);
            false
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub filtered: u64,
    pub debounced: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Paths with a task that has not finished yet.
#[derive(Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<PathBuf>>>);

impl InFlight {
    fn claim(&self, path: &Path) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf())
    }

    fn release(&self, path: &Path) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).remove(path);
    }
}

/// Releases the in-flight claim even if the task panics.
struct Claim {
    in_flight: InFlight,
    path: PathBuf,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.in_flight.release(&self.path);
    }
}

pub struct Dispatcher {
    handler: Arc<dyn FileHandler>,
    settle_delay: Duration,
    slots: Arc<Semaphore>,
    in_flight: InFlight,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(handler: Arc<dyn FileHandler>, settle_delay: Duration, max_in_flight: usize) -> Self {
        Self {
            handler,
            settle_delay,
            slots: Arc::new(Semaphore::new(max_in_flight)),
            in_flight: InFlight::default(),
            stats: DispatchStats::default(),
        }
    }

    /// Consume events until the queue closes, then wait for running tasks.
    pub async fn run(mut self, mut events: mpsc::Receiver<FileEvent>) -> DispatchStats {
        let mut tasks: JoinSet<(PathBuf, Result<()>)> = JoinSet::new();

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.accept(event, &mut tasks),
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => self.reap(joined),
            }
        }

        info!("Event queue closed, waiting for {} running tasks", tasks.len());
        while let Some(joined) = tasks.join_next().await {
            self.reap(joined);
        }

        info!(
            received = self.stats.received,
            filtered = self.stats.filtered,
            debounced = self.stats.debounced,
            succeeded = self.stats.succeeded,
            failed = self.stats.failed,
            "Dispatcher stopped"
        );
        self.stats
    }

    fn accept(&mut self, event: FileEvent, tasks: &mut JoinSet<(PathBuf, Result<()>)>) {
        if event.kind != FileEventKind::WriteCompleted {
            return;
        }
        self.stats.received += 1;

        let path = event.path;
        if let Some(exclusion) = path_exclusion(&path) {
            debug!(file = %path.display(), "Skipping: {}", exclusion);
            self.stats.filtered += 1;
            return;
        }

        if !self.in_flight.claim(&path) {
            debug!(file = %path.display(), "Already in flight, ignoring repeated event");
            self.stats.debounced += 1;
            return;
        }

        let claim = Claim {
            in_flight: self.in_flight.clone(),
            path: path.clone(),
        };
        let handler = self.handler.clone();
        let slots = self.slots.clone();
        let settle_delay = self.settle_delay;

        tasks.spawn(async move {
            let _claim = claim;
            // give slow filesystems time to flush before probing
            tokio::time::sleep(settle_delay).await;

            let result = match slots.acquire_owned().await {
                Ok(_permit) => handler.handle(&path).await,
                Err(_) => Err(ReelgateError::Request("worker pool closed".to_string())),
            };
            (path, result)
        });
    }

    fn reap(&mut self, joined: std::result::Result<(PathBuf, Result<()>), JoinError>) {
        match joined {
            Ok((_, Ok(()))) => self.stats.succeeded += 1,
            Ok((path, Err(e))) => {
                self.stats.failed += 1;
                warn!(file = %path.display(), "Processing failed: {}", e);
            }
            Err(e) => {
                self.stats.failed += 1;
                error!("File task panicked: {}", e);
            }
        }
    }
}
