//! Pure transition rules for step, job and workflow runs.
//!
//! Nothing here touches the store. The engine reads current state, asks
//! these functions what to do, and then performs a conditional write whose
//! guard is derived from the same tables.

use taskloom_types::run::{JobRunStatus, StepRunStatus, WorkflowRunStatus};
use uuid::Uuid;

use crate::error::EngineError;

use StepRunStatus::*;

/// Every legal step-run edge. Group-key runs use the same table.
///
/// `PendingAssignment -> PendingAssignment` is the requeue edge and
/// `Running -> PendingAssignment` is shared by the retry and reassignment
/// paths.
pub const STEP_TRANSITIONS: &[(StepRunStatus, StepRunStatus)] = &[
    (Pending, PendingAssignment),
    (Pending, Cancelled),
    (Pending, Failed),
    (PendingAssignment, PendingAssignment),
    (PendingAssignment, Assigned),
    (PendingAssignment, Failed),
    (PendingAssignment, Cancelled),
    (Assigned, Running),
    (Assigned, PendingAssignment),
    (Assigned, Succeeded),
    (Assigned, Failed),
    (Assigned, Cancelled),
    (Running, Succeeded),
    (Running, Failed),
    (Running, Cancelled),
    (Running, PendingAssignment),
];

pub fn is_legal_step_transition(from: StepRunStatus, to: StepRunStatus) -> bool {
    STEP_TRANSITIONS.contains(&(from, to))
}

/// Statuses from which `to` may be entered. Used as conditional-write guards.
pub fn step_sources(to: StepRunStatus) -> Vec<StepRunStatus> {
    STEP_TRANSITIONS
        .iter()
        .filter(|(_, target)| *target == to)
        .map(|(source, _)| *source)
        .collect()
}

// ---------------------------------------------------------------------------
// Terminal writes
// ---------------------------------------------------------------------------

/// What a terminal write against a run's current status should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalWrite {
    Apply,
    /// The run already holds the requested terminal status.
    NoOp,
}

/// Decide a terminal write. Re-applying the same terminal status is a no-op;
/// a different terminal status on a final run is a conflict.
pub fn check_terminal_write(
    id: Uuid,
    current: StepRunStatus,
    requested: StepRunStatus,
) -> Result<TerminalWrite, EngineError> {
    if !requested.is_terminal() {
        return Err(EngineError::InvalidTransition {
            id,
            from: format!("{current:?}"),
            to: format!("{requested:?}"),
        });
    }
    if current.is_terminal() {
        return if current == requested {
            Ok(TerminalWrite::NoOp)
        } else {
            Err(EngineError::AlreadyFinal {
                id,
                current: format!("{current:?}"),
                requested: format!("{requested:?}"),
            })
        };
    }
    if !is_legal_step_transition(current, requested) {
        return Err(EngineError::InvalidTransition {
            id,
            from: format!("{current:?}"),
            to: format!("{requested:?}"),
        });
    }
    Ok(TerminalWrite::Apply)
}

/// Same rule for workflow runs (used by cancellation).
pub fn check_workflow_terminal_write(
    id: Uuid,
    current: WorkflowRunStatus,
    requested: WorkflowRunStatus,
) -> Result<TerminalWrite, EngineError> {
    if current.is_terminal() {
        return if current == requested {
            Ok(TerminalWrite::NoOp)
        } else {
            Err(EngineError::AlreadyFinal {
                id,
                current: format!("{current:?}"),
                requested: format!("{requested:?}"),
            })
        };
    }
    Ok(TerminalWrite::Apply)
}

// ---------------------------------------------------------------------------
// Parent gate
// ---------------------------------------------------------------------------

/// Whether a PENDING step can be queued given its parents' statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentGate {
    /// Some parent is still in flight.
    Wait,
    /// Every parent succeeded.
    Ready,
    /// Every parent is final but at least one did not succeed.
    ShortCircuit,
}

pub fn parent_gate(parents: &[StepRunStatus]) -> ParentGate {
    if parents.iter().any(|s| !s.is_terminal()) {
        ParentGate::Wait
    } else if parents.iter().all(|s| *s == Succeeded) {
        ParentGate::Ready
    } else {
        ParentGate::ShortCircuit
    }
}

// ---------------------------------------------------------------------------
// Job and workflow resolution
// ---------------------------------------------------------------------------

/// The final status of a job, once every step in it is final.
///
/// Failure dominates cancellation, which dominates success.
pub fn resolve_job_status(steps: &[StepRunStatus]) -> Option<JobRunStatus> {
    if steps.iter().any(|s| !s.is_terminal()) {
        return None;
    }
    if steps.contains(&Failed) {
        Some(JobRunStatus::Failed)
    } else if steps.contains(&Cancelled) {
        Some(JobRunStatus::Cancelled)
    } else {
        Some(JobRunStatus::Succeeded)
    }
}

/// What to do with a workflow run after one of its jobs changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowResolution {
    /// Some job is still in flight.
    Wait,
    /// Default jobs failed and an on-failure job is declared but not started.
    StartOnFailure,
    /// Finalize. `skip_on_failure` asks the caller to cancel an on-failure
    /// job that will never be needed.
    Finish {
        status: WorkflowRunStatus,
        skip_on_failure: bool,
    },
}

pub fn resolve_workflow(
    default_jobs: &[JobRunStatus],
    on_failure: Option<JobRunStatus>,
) -> WorkflowResolution {
    if default_jobs.iter().any(|s| !s.is_terminal()) {
        return WorkflowResolution::Wait;
    }
    let failed = default_jobs.contains(&JobRunStatus::Failed);
    let status = if failed {
        WorkflowRunStatus::Failed
    } else if default_jobs.contains(&JobRunStatus::Cancelled) {
        WorkflowRunStatus::Cancelled
    } else {
        WorkflowRunStatus::Succeeded
    };

    match on_failure {
        Some(JobRunStatus::Pending) if failed => WorkflowResolution::StartOnFailure,
        Some(JobRunStatus::Pending) => WorkflowResolution::Finish {
            status,
            skip_on_failure: true,
        },
        Some(JobRunStatus::Running) => WorkflowResolution::Wait,
        _ => WorkflowResolution::Finish {
            status,
            skip_on_failure: false,
        },
    }
}
