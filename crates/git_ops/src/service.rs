//! Asynchronous git service consumed by the workspace layer.

use std::path::Path;

use async_trait::async_trait;
use git2::build::RepoBuilder;
use git2::{Cred, FetchOptions, RemoteCallbacks, Repository, StatusOptions};
use tracing::{debug, info};

use crate::{GitError, GitResult};

/// Summary of a working tree as reported by [`GitService::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoStatus {
    /// Current branch shorthand, if HEAD points at a branch.
    pub branch: Option<String>,
    /// True when nothing is modified, staged, or untracked.
    pub is_clean: bool,
    /// Paths with uncommitted changes, relative to the workdir.
    pub changed_paths: Vec<String>,
}

/// Credentials for remote git operations.
#[derive(Debug, Clone)]
pub enum GitCredentials {
    /// Username and password/token.
    UserPass { username: String, password: String },
    /// Default credentials (SSH agent or git config).
    Default,
}

/// Git operations the task workspace depends on.
#[async_trait]
pub trait GitService: Send + Sync {
    /// Clones `url` into `dest`, creating parent directories as needed.
    async fn clone_repository(&self, url: &str, dest: &Path) -> GitResult<()>;

    /// Fetches `origin` and fast-forwards the current branch.
    ///
    /// Returns `true` when the branch moved, `false` when it was already
    /// up to date. Diverged histories fail with
    /// [`GitError::FastForwardFailed`]; this never merges.
    async fn pull_latest(&self, workdir: &Path) -> GitResult<bool>;

    /// Reports branch and dirtiness for the checkout at `workdir`.
    async fn status(&self, workdir: &Path) -> GitResult<RepoStatus>;
}

/// [`GitService`] implementation backed by libgit2.
///
/// All libgit2 calls run on the blocking thread pool.
#[derive(Debug, Clone, Default)]
pub struct LibGitService {
    credentials: Option<GitCredentials>,
}

impl LibGitService {
    /// Creates a service that uses ambient credentials.
    pub fn new() -> Self {
        Self { credentials: None }
    }

    /// Sets explicit credentials for remote operations.
    pub fn with_credentials(mut self, credentials: GitCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

#[async_trait]
impl GitService for LibGitService {
    async fn clone_repository(&self, url: &str, dest: &Path) -> GitResult<()> {
        let url = url.to_string();
        let dest = dest.to_path_buf();
        let credentials = self.credentials.clone();
        info!(url = %url, dest = %dest.display(), "cloning repository");
        run_blocking(move || clone_sync(&url, &dest, credentials)).await
    }

    async fn pull_latest(&self, workdir: &Path) -> GitResult<bool> {
        let workdir = workdir.to_path_buf();
        let credentials = self.credentials.clone();
        run_blocking(move || pull_latest_sync(&workdir, credentials)).await
    }

    async fn status(&self, workdir: &Path) -> GitResult<RepoStatus> {
        let workdir = workdir.to_path_buf();
        run_blocking(move || status_sync(&workdir)).await
    }
}

/// Runs a blocking libgit2 call on the blocking thread pool.
async fn run_blocking<T, F>(f: F) -> GitResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> GitResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| GitError::TaskJoin(e.to_string()))?
}

fn open_repository(workdir: &Path) -> GitResult<Repository> {
    match Repository::open(workdir) {
        Ok(repo) => Ok(repo),
        Err(e) if e.code() == git2::ErrorCode::NotFound => {
            Err(GitError::RepositoryNotFound(workdir.display().to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn clone_sync(url: &str, dest: &Path, credentials: Option<GitCredentials>) -> GitResult<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut fetch_options = FetchOptions::new();
    if let Some(creds) = credentials {
        fetch_options.remote_callbacks(create_callbacks(creds));
    }

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_options);
    builder
        .clone(url, dest)
        .map_err(|e| GitError::CloneFailed(format!("{url}: {e}")))?;

    Ok(())
}

fn pull_latest_sync(workdir: &Path, credentials: Option<GitCredentials>) -> GitResult<bool> {
    let repo = open_repository(workdir)?;

    {
        let mut remote = repo.find_remote("origin")?;
        let mut fetch_options = FetchOptions::new();
        if let Some(creds) = credentials {
            fetch_options.remote_callbacks(create_callbacks(creds));
        }
        remote
            .fetch(&[] as &[&str], Some(&mut fetch_options), None)
            .map_err(|e| GitError::FetchFailed(e.to_string()))?;
    }

    // An empty remote writes no FETCH_HEAD; nothing to pull.
    let fetch_head = match repo.find_reference("FETCH_HEAD") {
        Ok(reference) => reference,
        Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let fetch_commit = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&fetch_commit])?;

    if analysis.is_up_to_date() {
        debug!(workdir = %workdir.display(), "already up to date");
        return Ok(false);
    }
    if !analysis.is_fast_forward() {
        return Err(GitError::FastForwardFailed(
            "local and remote histories have diverged".to_string(),
        ));
    }

    let head_name = repo
        .head()?
        .name()
        .map(str::to_owned)
        .ok_or_else(|| GitError::FastForwardFailed("HEAD is not a named reference".to_string()))?;
    let mut reference = repo.find_reference(&head_name)?;
    reference.set_target(fetch_commit.id(), "fast-forward")?;
    repo.set_head(&head_name)?;
    repo.checkout_head(Some(git2::build::CheckoutBuilder::default().force()))?;

    info!(workdir = %workdir.display(), "fast-forwarded to origin");
    Ok(true)
}

fn status_sync(workdir: &Path) -> GitResult<RepoStatus> {
    let repo = open_repository(workdir)?;

    let branch = match repo.head() {
        Ok(head) => head.shorthand().map(str::to_owned),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => None,
        Err(e) => return Err(e.into()),
    };

    let mut options = StatusOptions::new();
    options.include_untracked(true).exclude_submodules(true);
    let statuses = repo.statuses(Some(&mut options))?;

    let mut changed_paths = Vec::with_capacity(statuses.len());
    for entry in statuses.iter() {
        if entry.status() != git2::Status::CURRENT {
            if let Some(path) = entry.path() {
                changed_paths.push(path.to_string());
            }
        }
    }

    Ok(RepoStatus {
        branch,
        is_clean: changed_paths.is_empty(),
        changed_paths,
    })
}

/// Creates remote callbacks with the given credentials.
fn create_callbacks(credentials: GitCredentials) -> RemoteCallbacks<'static> {
    let mut callbacks = RemoteCallbacks::new();

    callbacks.credentials(move |_url, username_from_url, allowed_types| match &credentials {
        GitCredentials::UserPass { username, password } => {
            Cred::userpass_plaintext(username, password)
        }
        GitCredentials::Default => {
            if allowed_types.contains(git2::CredentialType::SSH_KEY) {
                if let Some(username) = username_from_url {
                    return Cred::ssh_key_from_agent(username);
                }
            }
            Cred::default()
        }
    });

    callbacks
}
