//! Engine error taxonomy.
//!
//! Every error maps to an [`ErrorKind`] telling the caller what to do with
//! it: conflicts are retried with fresh state, exhaustion leaves the run
//! queued, preconditions are rejected synchronously, application failures
//! are recorded on the run, and store errors are retried when transient.

use taskloom_types::error::{RepositoryError, ValidationIssue, format_issues};
use uuid::Uuid;

/// How a caller should treat an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A conditional write matched nothing. Expected under contention.
    Conflict,
    /// No capacity right now. The run stays queued.
    ResourceExhausted,
    /// The request can never succeed in the current state. Nothing mutated.
    Precondition,
    /// The step's own action failed.
    Application,
    /// Persistent store failure.
    Store,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("step run {0} is not pending")]
    StepRunIsNotPending(Uuid),

    #[error("step run {0} is not assigned")]
    StepRunIsNotAssigned(Uuid),

    #[error("run {id} is already final as {current}, cannot move to {requested}")]
    AlreadyFinal {
        id: Uuid,
        current: String,
        requested: String,
    },

    #[error("illegal transition for run {id}: {from} -> {to}")]
    InvalidTransition { id: Uuid, from: String, to: String },

    #[error("no worker available for action '{action}'")]
    NoWorkerAvailable { action: String },

    #[error("rate limit '{key}' exceeded")]
    RateLimitExceeded { key: String },

    #[error("step run {0} is not in a final state")]
    PreflightReplayStepRunNotInFinalState(Uuid),

    #[error("child step run {child} of step run {parent} is not in a final state")]
    PreflightReplayChildStepRunNotInFinalState { parent: Uuid, child: Uuid },

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("validation failed: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("{0} not found")]
    NotFound(String),

    #[error("dedupe value '{0}' is already in use for this workflow")]
    DuplicateDedupeValue(String),

    #[error("expression error: {0}")]
    Expression(String),

    #[error("step action failed: {0}")]
    ActionFailed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::StepRunIsNotPending(_)
            | EngineError::StepRunIsNotAssigned(_)
            | EngineError::AlreadyFinal { .. }
            | EngineError::Conflict(_)
            | EngineError::Repository(RepositoryError::Conflict(_)) => ErrorKind::Conflict,
            EngineError::NoWorkerAvailable { .. } | EngineError::RateLimitExceeded { .. } => {
                ErrorKind::ResourceExhausted
            }
            EngineError::InvalidTransition { .. }
            | EngineError::PreflightReplayStepRunNotInFinalState(_)
            | EngineError::PreflightReplayChildStepRunNotInFinalState { .. }
            | EngineError::CycleDetected(_)
            | EngineError::UnknownDependency(_)
            | EngineError::Validation(_)
            | EngineError::NotFound(_)
            | EngineError::DuplicateDedupeValue(_)
            | EngineError::Expression(_) => ErrorKind::Precondition,
            EngineError::ActionFailed(_) => ErrorKind::Application,
            EngineError::Repository(_) => ErrorKind::Store,
        }
    }

    /// Whether trying again later, with fresh state, may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Repository(e) => e.is_transient() || matches!(e, RepositoryError::Conflict(_)),
            other => matches!(
                other.kind(),
                ErrorKind::Conflict | ErrorKind::ResourceExhausted
            ),
        }
    }

    pub(crate) fn not_found(what: &str, id: &Uuid) -> Self {
        EngineError::NotFound(format!("{what} {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy() {
        let id = Uuid::now_v7();
        assert_eq!(EngineError::StepRunIsNotPending(id).kind(), ErrorKind::Conflict);
        assert_eq!(
            EngineError::NoWorkerAvailable {
                action: "x".to_string()
            }
            .kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            EngineError::PreflightReplayStepRunNotInFinalState(id).kind(),
            ErrorKind::Precondition
        );
        assert_eq!(
            EngineError::Repository(RepositoryError::Timeout).kind(),
            ErrorKind::Store
        );
        assert_eq!(
            EngineError::Repository(RepositoryError::Conflict("x".to_string())).kind(),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn test_retryability() {
        let id = Uuid::now_v7();
        assert!(EngineError::StepRunIsNotAssigned(id).is_retryable());
        assert!(EngineError::RateLimitExceeded { key: "k".to_string() }.is_retryable());
        assert!(EngineError::Repository(RepositoryError::Timeout).is_retryable());
        assert!(!EngineError::Repository(RepositoryError::Query("bad".to_string())).is_retryable());
        assert!(!EngineError::CycleDetected("a".to_string()).is_retryable());
    }

    #[test]
    fn test_validation_display_joins_issues() {
        let err = EngineError::Validation(vec![
            ValidationIssue::new("name", "must not be empty"),
            ValidationIssue::new("jobs", "at least one job is required"),
        ]);
        assert_eq!(
            err.to_string(),
            "validation failed: name: must not be empty; jobs: at least one job is required"
        );
    }
}
