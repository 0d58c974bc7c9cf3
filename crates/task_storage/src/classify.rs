//! Maps raw backend errors to classified [`BackendError`]s.
//!
//! Classification is pure: the same raw error always produces the same
//! kind, severity and retryability. SQLite and filesystem signals are
//! recognized by message substrings, Postgres primarily by SQLSTATE.

use crate::{BackendError, ErrorSeverity, StorageEngine, StorageErrorKind};

use ErrorSeverity::{Critical, High, Medium};
use StorageErrorKind::{Connection, Corruption, Permission, Resource, Schema, Timeout, Unknown};

/// Classifies a filesystem error.
pub fn classify_io(engine: StorageEngine, operation: &str, error: std::io::Error) -> BackendError {
    let message = error.to_string();
    let (kind, severity, retryable) = match error.kind() {
        std::io::ErrorKind::NotFound => (Resource, Medium, false),
        std::io::ErrorKind::PermissionDenied => (Permission, High, false),
        std::io::ErrorKind::StorageFull => (Resource, Critical, true),
        std::io::ErrorKind::TimedOut => (Timeout, Medium, true),
        _ => classify_signals(&message),
    };
    BackendError::new(kind, severity, retryable, engine, operation, message).with_source(error)
}

/// Classifies a JSON parse or serialize error.
pub fn classify_json(
    engine: StorageEngine,
    operation: &str,
    error: serde_json::Error,
) -> BackendError {
    let message = format!("invalid JSON content: {error}");
    let (kind, severity, retryable) = if error.is_io() {
        classify_signals(&error.to_string())
    } else {
        (Corruption, High, false)
    };
    BackendError::new(kind, severity, retryable, engine, operation, message).with_source(error)
}

/// Classifies a database error from `sqlx`.
pub fn classify_sqlx(engine: StorageEngine, operation: &str, error: sqlx::Error) -> BackendError {
    let message = error.to_string();
    let (kind, severity, retryable) = match &error {
        // Pool exhaustion is a connectivity problem, not a deadline.
        sqlx::Error::PoolTimedOut => (Connection, Medium, true),
        sqlx::Error::PoolClosed => (Connection, Medium, true),
        sqlx::Error::Database(db) => classify_database(engine, db.code().as_deref(), &message),
        _ => classify_signals(&message),
    };
    BackendError::new(kind, severity, retryable, engine, operation, message).with_source(error)
}

/// SQLSTATE mapping for Postgres; everything else falls back to
/// message signals.
fn classify_database(
    engine: StorageEngine,
    code: Option<&str>,
    message: &str,
) -> (StorageErrorKind, ErrorSeverity, bool) {
    if engine == StorageEngine::Postgres {
        match code {
            // invalid_password
            Some("28P01") => return (Permission, High, false),
            // invalid_catalog_name: the database does not exist
            Some("3D000") => return (Resource, High, false),
            // undefined_table
            Some("42P01") => return (Schema, High, false),
            // too_many_connections
            Some("53300") => return (Resource, High, true),
            _ => {}
        }
    }
    classify_signals(message)
}

/// Shared substring table for signals every engine can emit.
fn classify_signals(message: &str) -> (StorageErrorKind, ErrorSeverity, bool) {
    let lower = message.to_ascii_lowercase();
    if lower.contains("no such file") || lower.contains("enoent") {
        (Resource, Medium, false)
    } else if lower.contains("permission denied") || lower.contains("eacces") {
        (Permission, High, false)
    } else if lower.contains("no space left") || lower.contains("enospc") {
        (Resource, Critical, true)
    } else if lower.contains("database is locked") || lower.contains("sqlite_busy") {
        (Connection, Medium, true)
    } else if lower.contains("malformed") || lower.contains("sqlite_corrupt") {
        (Corruption, Critical, false)
    } else if lower.contains("readonly database") || lower.contains("sqlite_readonly") {
        (Permission, Medium, false)
    } else if lower.contains("unable to open database") || lower.contains("sqlite_cantopen") {
        (Resource, Medium, false)
    } else if lower.contains("no such table") || lower.contains("undefined table") {
        (Schema, High, false)
    } else if lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("connection closed")
        || lower.contains("econnrefused")
    {
        (Connection, Medium, true)
    } else if lower.contains("etimedout") || lower.contains("timed out") || lower.contains("timeout")
    {
        (Timeout, Medium, true)
    } else {
        (Unknown, Medium, false)
    }
}
