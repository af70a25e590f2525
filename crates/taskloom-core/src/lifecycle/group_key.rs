//! Group-key run transitions.
//!
//! A group-key run evaluates a workflow run's concurrency key on a worker.
//! It shares the step-run status domain but has no retries: a failed
//! evaluation fails the workflow run, and a successful one records the key
//! and hands the run to admission.

use chrono::Utc;
use serde_json::Value;
use taskloom_types::event::AnalyticsKind;
use taskloom_types::run::{GetGroupKeyRun, StepRunStatus, WorkflowRun, WorkflowRunStatus};
use uuid::Uuid;

use super::transition::{TerminalWrite, check_terminal_write};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::repository::run::UnitUpdate;
use crate::repository::{RunRepository, Store};

impl<S: Store> Engine<S> {
    pub async fn get_group_key_run(&self, id: &Uuid) -> Result<GetGroupKeyRun, EngineError> {
        let runs = self.store().runs();
        self.persist(|| runs.get_group_key_run(id))
            .await?
            .ok_or_else(|| EngineError::not_found("group key run", id))
    }

    pub async fn start_group_key_run(&self, id: &Uuid, worker_id: &Uuid) -> Result<GetGroupKeyRun, EngineError> {
        let update = UnitUpdate::to(StepRunStatus::Running)
            .started_at(Utc::now())
            .on_worker(*worker_id);
        let runs = self.store().runs();
        self.persist(|| runs.transition_group_key_run(id, &[StepRunStatus::Assigned], &update))
            .await?
            .ok_or(EngineError::StepRunIsNotAssigned(*id))
    }

    /// Record the evaluated key and admit the workflow run.
    pub async fn complete_group_key_run(&self, id: &Uuid, key: &str) -> Result<GetGroupKeyRun, EngineError> {
        if key.trim().is_empty() {
            return self.fail_group_key_run(id, "group key evaluated to an empty string").await;
        }
        let Some(done) = self
            .finish_group_key_run(id, StepRunStatus::Succeeded, |update| {
                update.output(Value::String(key.to_string()))
            })
            .await?
        else {
            return self.get_group_key_run(id).await;
        };

        let runs = self.store().runs();
        let recorded = self
            .persist(|| runs.set_concurrency_group_key(&done.workflow_run_id, key))
            .await?;
        if recorded {
            tracing::debug!(workflow_run_id = %done.workflow_run_id, key, "group key recorded");
            self.admit_workflow_run(&done.workflow_run_id).await?;
        }
        Ok(done)
    }

    /// Fail the evaluation and with it the workflow run.
    pub async fn fail_group_key_run(&self, id: &Uuid, error: &str) -> Result<GetGroupKeyRun, EngineError> {
        let Some(failed) = self
            .finish_group_key_run(id, StepRunStatus::Failed, |update| update.error(error))
            .await?
        else {
            return self.get_group_key_run(id).await;
        };
        let reason = format!("group key evaluation failed: {error}");
        self.abort_workflow_run(&failed.workflow_run_id, WorkflowRunStatus::Failed, &reason)
            .await?;
        Ok(failed)
    }

    /// ASSIGNED -> PENDING_ASSIGNMENT, releasing the slot.
    pub async fn unassign_group_key_run(&self, id: &Uuid) -> Result<GetGroupKeyRun, EngineError> {
        let now = Utc::now();
        let update = UnitUpdate::to(StepRunStatus::PendingAssignment)
            .clearing_assignment()
            .schedule_timeout_at(now + self.config().scheduling.schedule_timeout())
            .requeue_after(now);
        let runs = self.store().runs();
        self.persist(|| runs.transition_group_key_run(id, &[StepRunStatus::Assigned], &update))
            .await?
            .ok_or(EngineError::StepRunIsNotAssigned(*id))
    }

    /// Cancel the run's group-key run if it has not reached a worker.
    pub(crate) async fn cancel_waiting_group_key_run(&self, run: &WorkflowRun, reason: &str) -> Result<(), EngineError> {
        if run.concurrency_group_key.is_some() {
            return Ok(());
        }
        let runs = self.store().runs();
        let update = UnitUpdate::to(StepRunStatus::Cancelled)
            .error(reason)
            .finished_at(Utc::now());
        let Some(group_key_run) = self.persist(|| runs.get_group_key_run_for_workflow_run(&run.id)).await? else {
            return Ok(());
        };
        let waiting = [StepRunStatus::Pending, StepRunStatus::PendingAssignment];
        if waiting.contains(&group_key_run.status) {
            self.persist(|| runs.transition_group_key_run(&group_key_run.id, &waiting, &update))
                .await?;
        }
        Ok(())
    }

    /// Guarded terminal write shared by completion and failure. Returns
    /// `None` when the run already held the requested status.
    async fn finish_group_key_run<F>(
        &self,
        id: &Uuid,
        requested: StepRunStatus,
        fill: F,
    ) -> Result<Option<GetGroupKeyRun>, EngineError>
    where
        F: Fn(UnitUpdate) -> UnitUpdate,
    {
        let current = self.get_group_key_run(id).await?;
        if check_terminal_write(*id, current.status, requested)? == TerminalWrite::NoOp {
            return Ok(None);
        }
        let now = Utc::now();
        let update = fill(UnitUpdate::to(requested).finished_at(now));
        let runs = self.store().runs();
        let from = [current.status];
        let done = self
            .persist(|| runs.transition_group_key_run(id, &from, &update))
            .await?
            .ok_or_else(|| EngineError::Conflict(format!("group key run {id} changed concurrently")))?;
        self.record(
            AnalyticsKind::GroupKeyRunFinished,
            done.id,
            done.workflow_run_id,
            done.status,
            done.error.clone(),
            now,
        );
        Ok(Some(done))
    }
}
