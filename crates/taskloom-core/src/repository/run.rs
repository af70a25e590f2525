//! Run repository trait definition.
//!
//! Covers workflow runs, job runs, step runs, group-key runs, worker slots
//! and client events. Status changes go through guarded transitions that
//! name the set of statuses the row may currently be in; a transition whose
//! guard no longer holds returns `None` and changes nothing.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use taskloom_types::error::RepositoryError;
use taskloom_types::event::Event;
use taskloom_types::run::{
    GetGroupKeyRun, JobRun, JobRunStatus, StepRun, StepRunStatus, UnitKind, UnitRef, WorkflowRun,
    WorkflowRunStatus,
};
use uuid::Uuid;

use super::SortOrder;

// ---------------------------------------------------------------------------
// Parameter types
// ---------------------------------------------------------------------------

/// Everything persisted together when a workflow run is triggered.
#[derive(Debug, Clone)]
pub struct NewWorkflowRun {
    pub run: WorkflowRun,
    pub jobs: Vec<JobRun>,
    pub steps: Vec<StepRun>,
    pub group_key_run: Option<GetGroupKeyRun>,
}

/// Filter and page for workflow run listings.
#[derive(Debug, Clone, Default)]
pub struct WorkflowRunFilter {
    pub workflow_id: Option<Uuid>,
    pub statuses: Vec<WorkflowRunStatus>,
    pub group_key: Option<String>,
    pub include_deleted: bool,
    pub order: SortOrder,
    pub limit: u32,
    pub offset: u32,
}

/// Field changes applied together with a guarded step or group-key status
/// transition.
///
/// The store releases the unit's worker slot in the same transaction
/// whenever `status` is not a slot-holding state, so the slot invariant
/// cannot be broken by a caller forgetting to release.
#[derive(Debug, Clone)]
pub struct UnitUpdate {
    pub status: StepRunStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Clear worker, dispatcher and assignment time.
    pub clear_assignment: bool,
    pub schedule_timeout_at: Option<DateTime<Utc>>,
    pub timeout_at: Option<DateTime<Utc>>,
    pub requeue_after: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub increment_retry: bool,
    pub increment_requeue: bool,
    /// Apply only while the unit is bound to this worker.
    pub expected_worker: Option<Uuid>,
}

impl UnitUpdate {
    pub fn to(status: StepRunStatus) -> Self {
        Self {
            status,
            output: None,
            error: None,
            clear_assignment: false,
            schedule_timeout_at: None,
            timeout_at: None,
            requeue_after: None,
            started_at: None,
            finished_at: None,
            increment_retry: false,
            increment_requeue: false,
            expected_worker: None,
        }
    }

    pub fn on_worker(mut self, worker_id: Uuid) -> Self {
        self.expected_worker = Some(worker_id);
        self
    }

    pub fn output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn clearing_assignment(mut self) -> Self {
        self.clear_assignment = true;
        self
    }

    pub fn schedule_timeout_at(mut self, at: DateTime<Utc>) -> Self {
        self.schedule_timeout_at = Some(at);
        self
    }

    pub fn timeout_at(mut self, at: DateTime<Utc>) -> Self {
        self.timeout_at = Some(at);
        self
    }

    pub fn requeue_after(mut self, at: DateTime<Utc>) -> Self {
        self.requeue_after = Some(at);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn incrementing_retry(mut self) -> Self {
        self.increment_retry = true;
        self
    }

    pub fn incrementing_requeue(mut self) -> Self {
        self.increment_requeue = true;
        self
    }
}

/// Field changes applied with a guarded workflow run transition.
#[derive(Debug, Clone)]
pub struct WorkflowRunUpdate {
    pub status: WorkflowRunStatus,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Which runs an admission capacity check counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionScope {
    /// Runs of one workflow sharing one group key.
    Group { workflow_id: Uuid, key: String },
    /// All runs of one workflow, whatever their key.
    Workflow { workflow_id: Uuid },
}

/// A batch of admission decisions applied atomically.
///
/// The store applies every write conditionally and then checks that the
/// number of RUNNING runs in `scope` does not exceed `max_runs`. If any
/// guarded write misses or the cap would be exceeded, nothing is applied
/// and the call fails with `Conflict`.
#[derive(Debug, Clone)]
pub struct AdmissionPlan {
    pub scope: AdmissionScope,
    pub max_runs: u32,
    /// PENDING or QUEUED runs moved to RUNNING.
    pub start: Vec<Uuid>,
    /// PENDING runs moved to QUEUED.
    pub queue: Vec<Uuid>,
    /// RUNNING runs cancelled to make room.
    pub cancel: Vec<Uuid>,
    /// PENDING runs rejected without ever starting.
    pub drop: Vec<Uuid>,
    pub at: DateTime<Utc>,
}

impl AdmissionPlan {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.queue.is_empty() && self.cancel.is_empty() && self.drop.is_empty()
    }
}

/// A request to bind one unit to one worker.
#[derive(Debug, Clone)]
pub struct SlotRequest {
    pub kind: UnitKind,
    pub unit_id: Uuid,
    pub workflow_run_id: Uuid,
    pub worker_id: Uuid,
    pub dispatcher_id: Option<Uuid>,
    pub units: u32,
    /// Units to draw from each rate-limit key.
    pub rate_limits: BTreeMap<String, i32>,
    /// Record the worker as the workflow run's sticky worker if none is set.
    pub pin_sticky: bool,
    pub at: DateTime<Utc>,
}

/// Result of an assignment attempt. Only `Assigned` mutates anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignOutcome {
    Assigned,
    /// Another coordinator moved the unit first.
    NotPendingAssignment,
    /// The worker's free capacity dropped below the requested units.
    InsufficientSlots,
    RateLimited { key: String },
}

/// Reset a step run and its descendants for replay.
///
/// Applied only if every listed step run is terminal; otherwise `Conflict`.
#[derive(Debug, Clone)]
pub struct ReplayReset {
    pub workflow_run_id: Uuid,
    pub job_run_id: Uuid,
    pub target_id: Uuid,
    /// Target first, then descendants.
    pub step_run_ids: Vec<Uuid>,
    /// Replaces the target's input when set.
    pub input: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Repository trait for run persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Workflow runs
    // -----------------------------------------------------------------------

    /// Persist a run with its jobs, steps, parent edges and group-key run in
    /// one transaction. A repeated dedupe value for the same workflow fails
    /// with `Conflict`.
    fn create_workflow_run(
        &self,
        new_run: &NewWorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_workflow_run(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    fn list_workflow_runs(
        &self,
        filter: &WorkflowRunFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Guarded status transition. Stamps `started_at` when entering RUNNING
    /// and `finished_at` when entering a terminal state.
    fn transition_workflow_run(
        &self,
        id: &Uuid,
        from: &[WorkflowRunStatus],
        update: &WorkflowRunUpdate,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// Record the evaluated group key. Applied only while the run is PENDING
    /// and has no key yet.
    fn set_concurrency_group_key(
        &self,
        id: &Uuid,
        key: &str,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn apply_admission(
        &self,
        plan: &AdmissionPlan,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Stamp `deleted_at` on terminal runs finished before `finished_before`.
    fn soft_expire_workflow_runs(
        &self,
        finished_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Job runs
    // -----------------------------------------------------------------------

    fn get_job_run(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<JobRun>, RepositoryError>> + Send;

    fn list_job_runs(
        &self,
        workflow_run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<JobRun>, RepositoryError>> + Send;

    fn transition_job_run(
        &self,
        id: &Uuid,
        from: &[JobRunStatus],
        to: JobRunStatus,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Option<JobRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step runs
    // -----------------------------------------------------------------------

    fn get_step_run(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StepRun>, RepositoryError>> + Send;

    fn list_step_runs_for_job(
        &self,
        job_run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRun>, RepositoryError>> + Send;

    fn list_step_runs_for_workflow_run(
        &self,
        workflow_run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepRun>, RepositoryError>> + Send;

    fn transition_step_run(
        &self,
        id: &Uuid,
        from: &[StepRunStatus],
        update: &UnitUpdate,
    ) -> impl std::future::Future<Output = Result<Option<StepRun>, RepositoryError>> + Send;

    /// Bulk cancel by id list. Only rows still in `from` move; their slots
    /// are released. Returns the ids that moved.
    fn cancel_step_runs(
        &self,
        ids: &[Uuid],
        from: &[StepRunStatus],
        reason: &str,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<Uuid>, RepositoryError>> + Send;

    /// PENDING_ASSIGNMENT step runs whose `requeue_after` has passed, highest
    /// priority first, then oldest.
    fn list_assignable_step_runs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<StepRun>, RepositoryError>> + Send;

    /// RUNNING step runs whose execution deadline has passed.
    fn list_step_runs_past_execution_timeout(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<UnitRef>, RepositoryError>> + Send;

    fn reset_for_replay(
        &self,
        reset: &ReplayReset,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Group-key runs
    // -----------------------------------------------------------------------

    fn get_group_key_run(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<GetGroupKeyRun>, RepositoryError>> + Send;

    fn get_group_key_run_for_workflow_run(
        &self,
        workflow_run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<GetGroupKeyRun>, RepositoryError>> + Send;

    fn transition_group_key_run(
        &self,
        id: &Uuid,
        from: &[StepRunStatus],
        update: &UnitUpdate,
    ) -> impl std::future::Future<Output = Result<Option<GetGroupKeyRun>, RepositoryError>> + Send;

    fn list_assignable_group_key_runs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<GetGroupKeyRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Recovery scans (step runs and group-key runs together)
    // -----------------------------------------------------------------------

    /// PENDING_ASSIGNMENT units whose `schedule_timeout_at` is before `now`.
    fn list_units_past_schedule_timeout(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<UnitRef>, RepositoryError>> + Send;

    /// ASSIGNED units assigned before `assigned_before` and never acknowledged.
    fn list_units_past_ack_deadline(
        &self,
        assigned_before: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<UnitRef>, RepositoryError>> + Send;

    /// ASSIGNED or RUNNING units on workers that are inactive or whose last
    /// heartbeat is before `heartbeat_before`.
    fn list_units_on_lost_workers(
        &self,
        heartbeat_before: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<UnitRef>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Worker slots
    // -----------------------------------------------------------------------

    /// Bind a PENDING_ASSIGNMENT unit to a worker in one transaction: check
    /// capacity, draw rate-limit units, take the slot, mark ASSIGNED.
    fn assign_unit(
        &self,
        request: &SlotRequest,
    ) -> impl std::future::Future<Output = Result<AssignOutcome, RepositoryError>> + Send;

    /// Release a unit's slot. Idempotent: returns `true` only for the call
    /// that actually freed it.
    fn release_slot(
        &self,
        unit_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// The worker and unit count holding a slot for `unit_id`, if any.
    fn slot_holder(
        &self,
        unit_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<(Uuid, u32)>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn create_event(
        &self,
        event: &Event,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
