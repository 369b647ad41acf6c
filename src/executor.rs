use std::future::Future;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::classify::AssetCategory;
use crate::error::{Result, ReelgateError};

/// One exclusive lock per transcodable category.
///
/// Only external process execution goes through here; probing, classification
/// and queuing never take these locks. A long movie render therefore never
/// holds up trailers and vice versa.
#[derive(Debug, Default)]
pub struct CategoryExecutor {
    movie: Mutex<()>,
    trailer: Mutex<()>,
}

impl CategoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, category: AssetCategory) -> Option<&Mutex<()>> {
        match category {
            AssetCategory::Movie => Some(&self.movie),
            AssetCategory::Trailer => Some(&self.trailer),
            AssetCategory::Ineligible => None,
        }
    }

    /// Run `job` while holding the lock for `category`.
    ///
    /// The lock is released when the job finishes, whether it succeeded or
    /// not. A job error is logged and handed back to the caller.
    pub async fn run_exclusive<F, Fut, T>(&self, category: AssetCategory, job: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.lock_for(category).ok_or_else(|| {
            ReelgateError::Request(format!("no executor lock for {} assets", category))
        })?;

        debug!(%category, "Waiting for executor lock");
        let _guard = lock.lock().await;
        debug!(%category, "Executor lock acquired");

        let result = job().await;
        if let Err(e) = &result {
            warn!(%category, "Exclusive job failed: {}", e);
        }
        result
    }
}
