//! Task record and status definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a task.
///
/// The wire representation is the uppercase kebab form used in task files
/// and databases: `TODO`, `IN-PROGRESS`, `IN-REVIEW`, `DONE`, `CLOSED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum TaskStatus {
    /// Not yet started.
    Todo,
    /// Actively being worked on.
    InProgress,
    /// Work complete, awaiting review.
    InReview,
    /// Reviewed and finished.
    Done,
    /// Closed without completion.
    Closed,
}

impl TaskStatus {
    /// Returns the canonical wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "TODO",
            TaskStatus::InProgress => "IN-PROGRESS",
            TaskStatus::InReview => "IN-REVIEW",
            TaskStatus::Done => "DONE",
            TaskStatus::Closed => "CLOSED",
        }
    }

    /// Returns true when no further work is expected on the task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Closed)
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Todo
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a recognized task status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task status: {0}")]
pub struct ParseTaskStatusError(pub String);

impl FromStr for TaskStatus {
    type Err = ParseTaskStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TODO" => Ok(TaskStatus::Todo),
            "IN-PROGRESS" => Ok(TaskStatus::InProgress),
            "IN-REVIEW" => Ok(TaskStatus::InReview),
            "DONE" => Ok(TaskStatus::Done),
            "CLOSED" => Ok(TaskStatus::Closed),
            other => Err(ParseTaskStatusError(other.to_string())),
        }
    }
}

/// A single task record as persisted by the storage backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    /// Identifier, unique within a backend.
    pub id: String,
    /// Short human-readable title.
    pub title: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: TaskStatus,
    /// Path to an associated specification document, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_path: Option<String>,
    /// Backend-specific extra fields (issue numbers, parent ids).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub backend_metadata: serde_json::Value,
}

impl TaskRecord {
    /// Creates a new task record in the `TODO` state.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            spec_path: None,
            backend_metadata: serde_json::Value::Null,
        }
    }

    /// Sets the description for this task.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the status for this task.
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the associated specification path.
    pub fn with_spec_path(mut self, spec_path: impl Into<String>) -> Self {
        self.spec_path = Some(spec_path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::InProgress).unwrap(),
            "\"IN-PROGRESS\""
        );
        assert_eq!(serde_json::to_string(&TaskStatus::Todo).unwrap(), "\"TODO\"");
        assert_eq!(
            serde_json::from_str::<TaskStatus>("\"IN-REVIEW\"").unwrap(),
            TaskStatus::InReview
        );
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            TaskStatus::Todo,
            TaskStatus::InProgress,
            TaskStatus::InReview,
            TaskStatus::Done,
            TaskStatus::Closed,
        ] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("PENDING".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Done.is_terminal());
        assert!(TaskStatus::Closed.is_terminal());
        assert!(!TaskStatus::InReview.is_terminal());
    }

    #[test]
    fn test_task_record_creation() {
        let task = TaskRecord::new("042", "Add retry support")
            .with_description("Wrap backend calls in typed retries")
            .with_status(TaskStatus::InProgress)
            .with_spec_path("process/tasks/042-add-retry-support.md");

        assert_eq!(task.id, "042");
        assert_eq!(task.title, "Add retry support");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(
            task.spec_path.as_deref(),
            Some("process/tasks/042-add-retry-support.md")
        );
    }

    #[test]
    fn test_task_record_wire_casing() {
        let task = TaskRecord::new("1", "Title").with_spec_path("process/tasks/1.md");
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"specPath\""));
        assert!(!json.contains("\"spec_path\""));
        assert!(!json.contains("backendMetadata"));
    }

    #[test]
    fn test_task_record_minimal_json() {
        let task: TaskRecord =
            serde_json::from_str(r#"{"id":"7","title":"Minimal"}"#).unwrap();
        assert_eq!(task.status, TaskStatus::Todo);
        assert_eq!(task.description, "");
        assert!(task.spec_path.is_none());
        assert!(task.backend_metadata.is_null());
    }
}
