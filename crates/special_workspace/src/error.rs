//! Workspace error types.

use thiserror::Error;

/// Errors that can occur while operating on the shared task workspace.
#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// Lock was not acquired within the configured budget.
    #[error(
        "Timed out after {waited_ms}ms waiting for workspace lock {workspace}; \
         another session may hold it, retry shortly"
    )]
    LockTimeout {
        /// Lock file that stayed contended.
        workspace: String,
        /// Total wall-clock time spent waiting.
        waited_ms: u64,
    },

    /// Git operation failed.
    #[error("Git operation failed: {0}")]
    Git(#[from] git_ops::GitError),

    /// IO error touching the workspace or lock file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Lock record could not be serialized.
    #[error("Lock record error: {0}")]
    LockRecord(#[from] serde_json::Error),
}

/// Result type for workspace operations.
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;
