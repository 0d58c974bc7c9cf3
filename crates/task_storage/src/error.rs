//! Error types for the storage layer.

use std::error::Error as StdError;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage engine behind a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    #[default]
    Json,
    Sqlite,
    Postgres,
}

impl StorageEngine {
    /// Lowercase name used in logs and counter keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageEngine::Json => "json",
            StorageEngine::Sqlite => "sqlite",
            StorageEngine::Postgres => "postgres",
        }
    }
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string names no known storage engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown storage backend: {0}")]
pub struct ParseStorageEngineError(pub String);

impl FromStr for StorageEngine {
    type Err = ParseStorageEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(StorageEngine::Json),
            "sqlite" => Ok(StorageEngine::Sqlite),
            "postgres" => Ok(StorageEngine::Postgres),
            other => Err(ParseStorageEngineError(other.to_string())),
        }
    }
}

/// Category assigned to a classified backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageErrorKind {
    /// Connectivity failures: refused connections, busy databases,
    /// exhausted pools.
    Connection,
    /// An operation ran out of time.
    Timeout,
    /// A required resource is missing or exhausted: files, databases,
    /// disk space, server connection slots.
    Resource,
    /// Stored data cannot be parsed.
    Corruption,
    /// The caller lacks access rights.
    Permission,
    /// The stored schema does not match expectations.
    Schema,
    /// Nothing matched; surfaced as-is.
    Unknown,
}

impl StorageErrorKind {
    /// Lowercase name used in logs and counter keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageErrorKind::Connection => "connection",
            StorageErrorKind::Timeout => "timeout",
            StorageErrorKind::Resource => "resource",
            StorageErrorKind::Corruption => "corruption",
            StorageErrorKind::Permission => "permission",
            StorageErrorKind::Schema => "schema",
            StorageErrorKind::Unknown => "unknown",
        }
    }

    /// Default retryability for this kind. The classifier overrides it
    /// for specific signals, e.g. a missing file is `Resource` but a
    /// retry cannot conjure it.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::Connection | StorageErrorKind::Timeout | StorageErrorKind::Resource
        )
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How seriously a classified failure affects the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// Lowercase name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Low => "low",
            ErrorSeverity::Medium => "medium",
            ErrorSeverity::High => "high",
            ErrorSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend failure with classification metadata attached.
#[derive(Debug, Error)]
#[error("{engine} storage {operation} failed: {message}")]
pub struct BackendError {
    /// Failure category.
    pub kind: StorageErrorKind,
    /// Operational severity.
    pub severity: ErrorSeverity,
    /// Whether a retry may succeed, as ruled by the classifier.
    pub retryable: bool,
    /// Engine that failed.
    pub engine: StorageEngine,
    /// Operation that was running, e.g. `read_state`.
    pub operation: String,
    /// Raw error text.
    pub message: String,
    /// Underlying error, when one exists.
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl BackendError {
    /// Creates a classified failure with no underlying source.
    pub fn new(
        kind: StorageErrorKind,
        severity: ErrorSeverity,
        retryable: bool,
        engine: StorageEngine,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            retryable,
            engine,
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the raw error that was classified.
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Counter key used by the error tracker, `"{engine}:{kind}"`.
    pub fn counter_key(&self) -> String {
        format!("{}:{}", self.engine, self.kind)
    }
}

/// Errors surfaced by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No entity with the given id exists.
    #[error("{entity_type} not found: {id}")]
    NotFound {
        entity_type: &'static str,
        id: String,
    },

    /// An entity with the given id already exists.
    #[error("{entity_type} already exists: {id}")]
    AlreadyExists {
        entity_type: &'static str,
        id: String,
    },

    /// Entity serialization failed before anything was written.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A classified backend failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl StorageError {
    /// Not-found error for one entity.
    pub fn not_found(entity_type: &'static str, id: impl Into<String>) -> Self {
        StorageError::NotFound {
            entity_type,
            id: id.into(),
        }
    }

    /// Conflict error for a duplicate id.
    pub fn already_exists(entity_type: &'static str, id: impl Into<String>) -> Self {
        StorageError::AlreadyExists {
            entity_type,
            id: id.into(),
        }
    }

    /// Whether retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Backend(e) => e.retryable,
            _ => false,
        }
    }

    /// Classification kind, when this is a classified backend failure.
    pub fn kind(&self) -> Option<StorageErrorKind> {
        match self {
            StorageError::Backend(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Classification severity, when present.
    pub fn severity(&self) -> Option<ErrorSeverity> {
        match self {
            StorageError::Backend(e) => Some(e.severity),
            _ => None,
        }
    }
}

/// Convenience alias for storage results.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_round_trip() {
        for engine in [StorageEngine::Json, StorageEngine::Sqlite, StorageEngine::Postgres] {
            assert_eq!(engine.as_str().parse::<StorageEngine>().unwrap(), engine);
        }
        assert!("mongodb".parse::<StorageEngine>().is_err());
    }

    #[test]
    fn test_default_retryable_kinds() {
        assert!(StorageErrorKind::Connection.default_retryable());
        assert!(StorageErrorKind::Timeout.default_retryable());
        assert!(StorageErrorKind::Resource.default_retryable());
        assert!(!StorageErrorKind::Corruption.default_retryable());
        assert!(!StorageErrorKind::Permission.default_retryable());
        assert!(!StorageErrorKind::Schema.default_retryable());
        assert!(!StorageErrorKind::Unknown.default_retryable());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }

    #[test]
    fn test_counter_key_format() {
        let error = BackendError::new(
            StorageErrorKind::Connection,
            ErrorSeverity::Medium,
            true,
            StorageEngine::Sqlite,
            "read_state",
            "database is locked",
        );
        assert_eq!(error.counter_key(), "sqlite:connection");
    }

    #[test]
    fn test_display_formats() {
        let error = StorageError::not_found("task", "t-42");
        assert_eq!(error.to_string(), "task not found: t-42");

        let error = StorageError::already_exists("task", "t-42");
        assert_eq!(error.to_string(), "task already exists: t-42");

        let backend = BackendError::new(
            StorageErrorKind::Permission,
            ErrorSeverity::High,
            false,
            StorageEngine::Json,
            "write_state",
            "permission denied",
        );
        assert_eq!(
            backend.to_string(),
            "json storage write_state failed: permission denied"
        );
    }

    #[test]
    fn test_retryable_only_for_backend_errors() {
        let transient = StorageError::Backend(BackendError::new(
            StorageErrorKind::Connection,
            ErrorSeverity::Medium,
            true,
            StorageEngine::Postgres,
            "connect",
            "connection refused",
        ));
        assert!(transient.is_retryable());
        assert_eq!(transient.kind(), Some(StorageErrorKind::Connection));

        assert!(!StorageError::not_found("task", "t-1").is_retryable());
        assert_eq!(StorageError::not_found("task", "t-1").kind(), None);
    }
}
