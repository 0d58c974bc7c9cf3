//! Shared workspace lifecycle and serialized operations.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use git_ops::GitService;

use crate::{WorkspaceConfig, WorkspaceLock, WorkspaceResult};

/// Manages the single shared git checkout used for in-tree task storage.
///
/// One manager is bound to one repository URL. Every mutating operation
/// goes through [`SpecialWorkspaceManager::perform_operation`], which
/// serializes access with the advisory workspace lock.
pub struct SpecialWorkspaceManager {
    repo_url: String,
    workspace_path: PathBuf,
    git: Arc<dyn GitService>,
    lock: WorkspaceLock,
}

impl SpecialWorkspaceManager {
    /// Clones or opens the workspace for `repo_url` and binds a manager to it.
    ///
    /// Safe to call repeatedly: an existing checkout is reused.
    pub async fn create(
        git: Arc<dyn GitService>,
        repo_url: impl Into<String>,
        config: &WorkspaceConfig,
    ) -> WorkspaceResult<Self> {
        let repo_url = repo_url.into();
        let workspace_path = config.workspace_dir(&repo_url);

        if workspace_path.join(".git").exists() {
            debug!(path = %workspace_path.display(), "reusing existing workspace");
        } else {
            info!(
                repo_url = %repo_url,
                path = %workspace_path.display(),
                "initializing workspace"
            );
            git.clone_repository(&repo_url, &workspace_path).await?;
        }

        let holder_id = format!("{}-{}", std::process::id(), Uuid::new_v4());
        let lock = WorkspaceLock::new(&workspace_path, holder_id)
            .with_timeout(Duration::from_millis(config.lock_timeout_ms))
            .with_poll_interval(Duration::from_millis(config.lock_poll_interval_ms));

        Ok(Self {
            repo_url,
            workspace_path,
            git,
            lock,
        })
    }

    /// URL of the repository backing this workspace.
    pub fn repo_url(&self) -> &str {
        &self.repo_url
    }

    /// Absolute path of the workspace checkout.
    pub fn workspace_path(&self) -> &Path {
        &self.workspace_path
    }

    /// Runs `operation` with exclusive access to the workspace.
    ///
    /// The lock is released once the callback finishes, whether or not its
    /// result is an error. Only failures before the callback starts (lock
    /// contention, lock IO) produce `Err`, so callers can tell "never ran"
    /// apart from "ran and failed" by inspecting the returned `R`.
    pub async fn perform_operation<R, F, Fut>(
        &self,
        name: &str,
        operation: F,
    ) -> WorkspaceResult<R>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = R>,
    {
        self.lock.acquire().await?;
        debug!(
            operation = name,
            path = %self.workspace_path.display(),
            "workspace operation started"
        );

        self.ensure_current().await;

        let result = operation(self.workspace_path.clone()).await;

        if let Err(e) = self.lock.release().await {
            warn!(operation = name, error = %e, "failed to release workspace lock");
        }
        debug!(operation = name, "workspace operation finished");

        Ok(result)
    }

    /// Best-effort refresh of the checkout before an operation.
    ///
    /// A dirty tree skips the pull so uncommitted task changes are never
    /// clobbered; a pull failure is logged and the operation proceeds with
    /// the local copy, which keeps sessions usable offline.
    async fn ensure_current(&self) {
        match self.git.status(&self.workspace_path).await {
            Ok(status) if !status.is_clean => {
                warn!(
                    path = %self.workspace_path.display(),
                    changed = status.changed_paths.len(),
                    "workspace has local changes, skipping pull"
                );
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "workspace status check failed, skipping pull");
                return;
            }
        }

        match self.git.pull_latest(&self.workspace_path).await {
            Ok(true) => {
                debug!(path = %self.workspace_path.display(), "workspace updated from origin")
            }
            Ok(false) => {}
            Err(e) => warn!(error = %e, "workspace pull failed, continuing with local copy"),
        }
    }
}
