//! Workspace configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Configuration for the shared task workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory for Trellis state; workspaces live under it.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Lock acquisition budget and staleness threshold in milliseconds.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Sleep between lock attempts while contended, in milliseconds.
    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("trellis")
}

fn default_lock_timeout_ms() -> u64 {
    30_000
}

fn default_lock_poll_interval_ms() -> u64 {
    100
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            lock_timeout_ms: default_lock_timeout_ms(),
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
        }
    }
}

impl WorkspaceConfig {
    /// Loads configuration from the environment.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();

        let mut config = Self::default();

        if let Ok(dir) = std::env::var("TRELLIS_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }

        if let Ok(ms) = std::env::var("TRELLIS_LOCK_TIMEOUT_MS") {
            config.lock_timeout_ms = ms.parse().unwrap_or(default_lock_timeout_ms());
        }

        if let Ok(ms) = std::env::var("TRELLIS_LOCK_POLL_INTERVAL_MS") {
            config.lock_poll_interval_ms = ms.parse().unwrap_or(default_lock_poll_interval_ms());
        }

        config
    }

    /// Directory that holds the checkout for `repo_url`.
    ///
    /// The name stays stable across sessions so every process maps the
    /// same URL to the same checkout.
    pub fn workspace_dir(&self, repo_url: &str) -> PathBuf {
        self.state_dir
            .join("workspaces")
            .join(workspace_dir_name(repo_url))
    }
}

/// Stable directory name for a repository URL: sanitized repo name plus a
/// short digest so distinct URLs with the same tail never collide.
fn workspace_dir_name(repo_url: &str) -> String {
    let tail = repo_url
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default();

    let mut sanitized: String = tail
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect();
    if sanitized.is_empty() {
        sanitized = "workspace".to_string();
    }

    let mut hasher = Sha256::new();
    hasher.update(repo_url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    format!("{}-{}", sanitized, &digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_dir_name_is_stable() {
        let a = workspace_dir_name("https://example.com/acme/tasks.git");
        let b = workspace_dir_name("https://example.com/acme/tasks.git");
        assert_eq!(a, b);
        assert!(a.starts_with("tasks-"));
    }

    #[test]
    fn test_workspace_dir_name_distinguishes_urls() {
        let a = workspace_dir_name("https://example.com/acme/tasks.git");
        let b = workspace_dir_name("https://example.com/other/tasks.git");
        assert_ne!(a, b);
    }

    #[test]
    fn test_workspace_dir_name_ssh_style() {
        let name = workspace_dir_name("git@example.com:acme/tasks.git");
        assert!(name.starts_with("tasks-"));
    }

    #[test]
    fn test_defaults() {
        let config = WorkspaceConfig::default();
        assert_eq!(config.lock_timeout_ms, 30_000);
        assert_eq!(config.lock_poll_interval_ms, 100);
        assert!(config.state_dir.ends_with("trellis"));
    }
}
