//! Run domain types: workflow runs, job runs, step runs and group-key runs.
//!
//! Each status enum names its terminal set explicitly and exposes it through
//! `is_terminal()`. Callers never decide finality by listing the states a run
//! is *not* in.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::DesiredLabel;

/// Lowest accepted run priority.
pub const MIN_PRIORITY: u8 = 1;
/// Highest accepted run priority.
pub const MAX_PRIORITY: u8 = 3;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    pub const TERMINAL: [Self; 3] = [Self::Succeeded, Self::Failed, Self::Cancelled];
    pub const ACTIVE: [Self; 3] = [Self::Pending, Self::Queued, Self::Running];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowRunStatus::Pending => write!(f, "pending"),
            WorkflowRunStatus::Queued => write!(f, "queued"),
            WorkflowRunStatus::Running => write!(f, "running"),
            WorkflowRunStatus::Succeeded => write!(f, "succeeded"),
            WorkflowRunStatus::Failed => write!(f, "failed"),
            WorkflowRunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(WorkflowRunStatus::Pending),
            "queued" => Ok(WorkflowRunStatus::Queued),
            "running" => Ok(WorkflowRunStatus::Running),
            "succeeded" => Ok(WorkflowRunStatus::Succeeded),
            "failed" => Ok(WorkflowRunStatus::Failed),
            "cancelled" => Ok(WorkflowRunStatus::Cancelled),
            other => Err(format!("invalid workflow run status: '{other}'")),
        }
    }
}

/// Status of a job run. Jobs have no retry substate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobRunStatus {
    pub const TERMINAL: [Self; 3] = [Self::Succeeded, Self::Failed, Self::Cancelled];
    pub const ACTIVE: [Self; 2] = [Self::Pending, Self::Running];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

/// Status shared by step runs and group-key runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    Pending,
    PendingAssignment,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl StepRunStatus {
    pub const TERMINAL: [Self; 3] = [Self::Succeeded, Self::Failed, Self::Cancelled];
    pub const ACTIVE: [Self; 4] = [
        Self::Pending,
        Self::PendingAssignment,
        Self::Assigned,
        Self::Running,
    ];
    /// States in which the run occupies a worker slot.
    pub const SLOTTED: [Self; 2] = [Self::Assigned, Self::Running];
    /// States a step can be in before any worker has begun executing it.
    pub const NOT_STARTED: [Self; 3] = [Self::Pending, Self::PendingAssignment, Self::Assigned];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// True iff a run in this state must hold exactly one worker slot.
    pub fn holds_slot(self) -> bool {
        Self::SLOTTED.contains(&self)
    }
}

impl fmt::Display for StepRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepRunStatus::Pending => write!(f, "pending"),
            StepRunStatus::PendingAssignment => write!(f, "pending_assignment"),
            StepRunStatus::Assigned => write!(f, "assigned"),
            StepRunStatus::Running => write!(f, "running"),
            StepRunStatus::Succeeded => write!(f, "succeeded"),
            StepRunStatus::Failed => write!(f, "failed"),
            StepRunStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// What caused a workflow run to exist. Exactly one variant is populated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Event {
        event_id: Uuid,
    },
    Cron {
        timer_id: Uuid,
        expression: String,
    },
    Schedule {
        timer_id: Uuid,
    },
    ParentChild {
        parent_run_id: Uuid,
        parent_step_run_id: Uuid,
        child_index: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        child_key: Option<String>,
    },
}

/// Discriminant of [`RunTrigger`], used for storage and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Manual,
    Event,
    Cron,
    Schedule,
    ParentChild,
}

impl RunTrigger {
    pub fn kind(&self) -> TriggerKind {
        match self {
            Self::Manual => TriggerKind::Manual,
            Self::Event { .. } => TriggerKind::Event,
            Self::Cron { .. } => TriggerKind::Cron,
            Self::Schedule { .. } => TriggerKind::Schedule,
            Self::ParentChild { .. } => TriggerKind::ParentChild,
        }
    }

    /// The id of the entity that caused the run, if any.
    pub fn reference_id(&self) -> Option<Uuid> {
        match self {
            Self::Manual => None,
            Self::Event { event_id } => Some(*event_id),
            Self::Cron { timer_id, .. } | Self::Schedule { timer_id } => Some(*timer_id),
            Self::ParentChild {
                parent_step_run_id, ..
            } => Some(*parent_step_run_id),
        }
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// One execution of a workflow version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    /// Denormalized for display.
    pub workflow_name: String,
    pub status: WorkflowRunStatus,
    pub trigger: RunTrigger,
    pub input: serde_json::Value,
    #[serde(default)]
    pub additional_metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_value: Option<String>,
    pub priority: u8,
    /// Evaluated concurrency key. `None` until the key is known, or when the
    /// workflow declares no concurrency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_group_key: Option<String>,
    /// Worker the run is pinned to once its first step is assigned (sticky workflows).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky_worker_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Set when the run is soft-expired by retention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Whether a job runs as part of the normal DAG or only after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Default,
    OnFailure,
}

/// A named group of step runs inside one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub job_name: String,
    pub kind: JobKind,
    pub status: JobRunStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// One execution of a declared step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub job_run_id: Uuid,
    /// The step's readable id from the declaration.
    pub step_name: String,
    pub action_id: String,
    pub status: StepRunStatus,
    /// Step runs in the same job that must finish before this one is queued.
    #[serde(default)]
    pub parent_ids: Vec<Uuid>,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub priority: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    pub requeue_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Deadline for leaving PENDING_ASSIGNMENT.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_timeout_at: Option<DateTime<Utc>>,
    /// Execution deadline while RUNNING.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    /// Earliest time the allocator may try this run again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeue_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatcher_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    /// Worker slot units consumed while assigned or running.
    pub slot_units: u32,
    /// Units required per rate-limit key.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, i32>,
    #[serde(default)]
    pub desired_labels: BTreeMap<String, DesiredLabel>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRun {
    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// Evaluates a workflow run's concurrency key on a worker.
///
/// Shares the step-run status domain and finality rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetGroupKeyRun {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub action_id: String,
    pub status: StepRunStatus,
    pub input: serde_json::Value,
    /// The evaluated group key, once succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub requeue_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_timeout_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatcher_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Schedulable units
// ---------------------------------------------------------------------------

/// The two kinds of run a worker slot can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    StepRun,
    GroupKeyRun,
}

/// A lightweight reference to a slot-bearing run, as returned by recovery scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRef {
    pub kind: UnitKind,
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub status: StepRunStatus,
    pub requeue_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
}
