//! Advisory file lock guarding the shared task workspace.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{WorkspaceError, WorkspaceResult};

/// Name of the lock file inside the workspace directory.
pub const LOCK_FILE_NAME: &str = ".trellis-lock";

/// Contents of the advisory lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Session that holds the lock.
    pub holder_id: String,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
}

/// Advisory lock over a workspace directory.
///
/// The lock file is created with `O_CREAT|O_EXCL` semantics, so creation
/// is atomic for every process on the same filesystem. A lock older than
/// the timeout is treated as abandoned by a crashed holder and reclaimed.
#[derive(Debug, Clone)]
pub struct WorkspaceLock {
    lock_path: PathBuf,
    holder_id: String,
    lock_timeout: Duration,
    poll_interval: Duration,
}

impl WorkspaceLock {
    /// Creates a lock handle for the given workspace directory.
    pub fn new(workspace: &Path, holder_id: impl Into<String>) -> Self {
        Self {
            lock_path: workspace.join(LOCK_FILE_NAME),
            holder_id: holder_id.into(),
            lock_timeout: Duration::from_millis(30_000),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Overrides the acquisition budget and staleness threshold.
    pub fn with_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Overrides the sleep between contended attempts.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.lock_path
    }

    /// Acquires the lock, waiting up to the configured timeout.
    ///
    /// A lock whose record is older than the timeout is force-reclaimed;
    /// a live one is polled until the budget runs out, then acquisition
    /// fails with [`WorkspaceError::LockTimeout`].
    pub async fn acquire(&self) -> WorkspaceResult<()> {
        let started = Instant::now();

        loop {
            if self.try_create().await? {
                debug!(
                    holder_id = %self.holder_id,
                    path = %self.lock_path.display(),
                    "workspace lock acquired"
                );
                return Ok(());
            }

            if let Some((age, previous_holder)) = self.holder_age().await? {
                if age > self.lock_timeout {
                    warn!(
                        previous_holder = previous_holder.as_deref().unwrap_or("unknown"),
                        age_ms = age.as_millis() as u64,
                        path = %self.lock_path.display(),
                        "reclaiming stale workspace lock"
                    );
                    self.force_write().await?;
                    return Ok(());
                }
            }

            if started.elapsed() >= self.lock_timeout {
                return Err(WorkspaceError::LockTimeout {
                    workspace: self.lock_path.display().to_string(),
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Releases the lock. A missing lock file is not an error.
    pub async fn release(&self) -> WorkspaceResult<()> {
        match tokio::fs::remove_file(&self.lock_path).await {
            Ok(()) => {
                debug!(
                    holder_id = %self.holder_id,
                    path = %self.lock_path.display(),
                    "workspace lock released"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Attempts atomic creation. Returns false when the lock is held.
    async fn try_create(&self) -> WorkspaceResult<bool> {
        let body = self.record_body()?;

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await
        {
            Ok(mut file) => {
                file.write_all(body.as_bytes()).await?;
                file.flush().await?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Age and holder of the existing lock; `None` when the file vanished.
    ///
    /// An unparseable record falls back to the file's mtime, so a lock
    /// mid-write by another process is not stolen the instant it appears.
    async fn holder_age(&self) -> WorkspaceResult<Option<(Duration, Option<String>)>> {
        let contents = match tokio::fs::read_to_string(&self.lock_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<LockRecord>(&contents) {
            Ok(record) => {
                let age = Utc::now()
                    .signed_duration_since(record.acquired_at)
                    .to_std()
                    .unwrap_or_default();
                Ok(Some((age, Some(record.holder_id))))
            }
            Err(_) => {
                let age = tokio::fs::metadata(&self.lock_path)
                    .await
                    .ok()
                    .and_then(|meta| meta.modified().ok())
                    .and_then(|mtime| mtime.elapsed().ok())
                    .unwrap_or(self.lock_timeout + Duration::from_millis(1));
                Ok(Some((age, None)))
            }
        }
    }

    /// Overwrites the lock file with our own record.
    async fn force_write(&self) -> WorkspaceResult<()> {
        let body = self.record_body()?;
        tokio::fs::write(&self.lock_path, body).await?;
        Ok(())
    }

    fn record_body(&self) -> WorkspaceResult<String> {
        let record = LockRecord {
            holder_id: self.holder_id.clone(),
            acquired_at: Utc::now(),
        };
        Ok(serde_json::to_string_pretty(&record)?)
    }
}
