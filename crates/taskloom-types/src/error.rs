use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from repository operations (used by trait definitions in taskloom-core).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store call timed out")]
    Timeout,

    #[error("store busy: {0}")]
    Busy(String),
}

impl RepositoryError {
    /// Timeouts, lock contention and dropped connections are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RepositoryError::Connection | RepositoryError::Timeout | RepositoryError::Busy(_)
        )
    }
}

/// One problem found by a pure validation function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted path to the offending field, e.g. `jobs[0].steps[1].parents`.
    pub path: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Join a list of issues for single-line error messages.
pub fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_transient_classification() {
        assert!(RepositoryError::Timeout.is_transient());
        assert!(RepositoryError::Busy("database is locked".to_string()).is_transient());
        assert!(!RepositoryError::Conflict("status".to_string()).is_transient());
        assert!(!RepositoryError::NotFound.is_transient());
    }

    #[test]
    fn test_format_issues() {
        let issues = vec![
            ValidationIssue::new("name", "must not be empty"),
            ValidationIssue::new("jobs", "at least one job is required"),
        ];
        assert_eq!(
            format_issues(&issues),
            "name: must not be empty; jobs: at least one job is required"
        );
    }
}
