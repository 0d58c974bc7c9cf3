//! Git error types

use thiserror::Error;

/// Errors that can occur during git operations
#[derive(Error, Debug)]
pub enum GitError {
    /// Underlying git2 error
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    /// Repository not found
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    /// Clone failed
    #[error("Clone failed: {0}")]
    CloneFailed(String),

    /// Fetch failed
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// Current branch cannot be fast-forwarded to the remote
    #[error("Fast-forward failed: {0}")]
    FastForwardFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking git task did not complete
    #[error("Git task failed: {0}")]
    TaskJoin(String),
}

/// Result type for git operations
pub type GitResult<T> = Result<T, GitError>;
