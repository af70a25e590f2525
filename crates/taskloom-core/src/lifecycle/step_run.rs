//! Step-run transitions.

use chrono::{Duration, Utc};
use serde_json::Value;
use taskloom_types::event::{AnalyticsKind, EngineEvent};
use taskloom_types::run::{StepRun, StepRunStatus};
use uuid::Uuid;

use super::transition::{ParentGate, TerminalWrite, check_terminal_write, parent_gate};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::repository::run::UnitUpdate;
use crate::repository::{RunRepository, Store};

/// How many times a terminal write re-reads after losing a race.
const FINISH_ATTEMPTS: u32 = 2;

/// The terminal outcome a worker (or the engine) reports for a step run.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded(Value),
    Failed(String),
    Cancelled(String),
}

impl StepOutcome {
    pub fn status(&self) -> StepRunStatus {
        match self {
            StepOutcome::Succeeded(_) => StepRunStatus::Succeeded,
            StepOutcome::Failed(_) => StepRunStatus::Failed,
            StepOutcome::Cancelled(_) => StepRunStatus::Cancelled,
        }
    }
}

/// What a terminal write did.
#[derive(Debug, Clone)]
pub enum StepTransition {
    /// The step run is now final.
    Applied(StepRun),
    /// The failure was absorbed by a retry; the step run is queued again.
    Retrying(StepRun),
    /// The step run already held the requested final status.
    NoOp(StepRun),
}

impl StepTransition {
    pub fn step_run(&self) -> &StepRun {
        match self {
            StepTransition::Applied(s) | StepTransition::Retrying(s) | StepTransition::NoOp(s) => s,
        }
    }
}

impl<S: Store> Engine<S> {
    pub async fn get_step_run(&self, id: &Uuid) -> Result<StepRun, EngineError> {
        let runs = self.store().runs();
        self.persist(|| runs.get_step_run(id))
            .await?
            .ok_or_else(|| EngineError::not_found("step run", id))
    }

    /// Every step run of a workflow run, across all of its jobs.
    pub async fn list_step_runs(&self, workflow_run_id: &Uuid) -> Result<Vec<StepRun>, EngineError> {
        let runs = self.store().runs();
        self.persist(|| runs.list_step_runs_for_workflow_run(workflow_run_id)).await
    }

    /// PENDING -> PENDING_ASSIGNMENT once every parent has succeeded.
    ///
    /// A step that is not PENDING fails with `StepRunIsNotPending` and is not
    /// touched. A step whose parents did not all succeed is cancelled instead
    /// of queued.
    pub async fn queue_step_run(&self, id: &Uuid) -> Result<StepRun, EngineError> {
        let step = self.get_step_run(id).await?;
        if step.status != StepRunStatus::Pending {
            return Err(EngineError::StepRunIsNotPending(*id));
        }
        let runs = self.store().runs();
        let siblings = self.persist(|| runs.list_step_runs_for_job(&step.job_run_id)).await?;
        match self.gate_parents(&step, &siblings) {
            ParentGate::Ready => self.enqueue_step_run(id).await,
            ParentGate::Wait => Err(EngineError::Conflict(format!(
                "step run {id} has parents still in flight"
            ))),
            ParentGate::ShortCircuit => {
                self.short_circuit(&step).await?;
                self.resolve_job_run(&step.job_run_id).await?;
                self.get_step_run(id).await
            }
        }
    }

    /// The guarded PENDING -> PENDING_ASSIGNMENT write, without a parent check.
    pub(crate) async fn enqueue_step_run(&self, id: &Uuid) -> Result<StepRun, EngineError> {
        let now = Utc::now();
        let update = UnitUpdate::to(StepRunStatus::PendingAssignment)
            .schedule_timeout_at(now + self.config().scheduling.schedule_timeout())
            .requeue_after(now);
        let runs = self.store().runs();
        let queued = self
            .persist(|| runs.transition_step_run(id, &[StepRunStatus::Pending], &update))
            .await?
            .ok_or(EngineError::StepRunIsNotPending(*id))?;
        tracing::debug!(step_run_id = %id, step = %queued.step_name, "step run queued");
        self.emit_step(&queued);
        Ok(queued)
    }

    /// ASSIGNED -> RUNNING, acknowledged by the worker the step is bound to.
    pub async fn start_step_run(&self, id: &Uuid, worker_id: &Uuid) -> Result<StepRun, EngineError> {
        let step = self.get_step_run(id).await?;
        if step.status != StepRunStatus::Assigned || step.worker_id != Some(*worker_id) {
            return Err(EngineError::StepRunIsNotAssigned(*id));
        }

        let now = Utc::now();
        let mut update = UnitUpdate::to(StepRunStatus::Running)
            .started_at(now)
            .on_worker(*worker_id);
        if let Some(secs) = step.timeout_secs {
            let deadline = i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .and_then(|timeout| now.checked_add_signed(timeout));
            match deadline {
                Some(at) => update = update.timeout_at(at),
                None => tracing::warn!(step_run_id = %id, timeout_secs = secs, "step timeout out of range, not enforced"),
            }
        }
        let runs = self.store().runs();
        let started = self
            .persist(|| runs.transition_step_run(id, &[StepRunStatus::Assigned], &update))
            .await?
            .ok_or(EngineError::StepRunIsNotAssigned(*id))?;

        self.start_job_run(&started.job_run_id).await?;
        tracing::debug!(step_run_id = %id, %worker_id, "step run started");
        self.emit_step(&started);
        Ok(started)
    }

    pub async fn complete_step_run(&self, id: &Uuid, output: Value) -> Result<StepTransition, EngineError> {
        self.finish_step_run(id, StepOutcome::Succeeded(output)).await
    }

    /// Record a failure. Retried while the step has retries left and was
    /// executing; final otherwise.
    pub async fn fail_step_run(&self, id: &Uuid, error: impl Into<String>) -> Result<StepTransition, EngineError> {
        self.finish_step_run(id, StepOutcome::Failed(error.into())).await
    }

    pub async fn cancel_step_run(&self, id: &Uuid, reason: impl Into<String>) -> Result<StepTransition, EngineError> {
        self.finish_step_run(id, StepOutcome::Cancelled(reason.into())).await
    }

    /// Apply a terminal outcome, then cascade to children, the job and the
    /// workflow run.
    pub async fn finish_step_run(&self, id: &Uuid, outcome: StepOutcome) -> Result<StepTransition, EngineError> {
        let requested = outcome.status();
        let runs = self.store().runs();

        for _ in 0..FINISH_ATTEMPTS {
            let step = self.get_step_run(id).await?;
            if check_terminal_write(*id, step.status, requested)? == TerminalWrite::NoOp {
                return Ok(StepTransition::NoOp(step));
            }

            let now = Utc::now();
            let retrying = matches!(outcome, StepOutcome::Failed(_))
                && step.status.holds_slot()
                && step.can_retry();
            let update = match &outcome {
                StepOutcome::Failed(error) if retrying => UnitUpdate::to(StepRunStatus::PendingAssignment)
                    .error(error.clone())
                    .clearing_assignment()
                    .incrementing_retry()
                    .schedule_timeout_at(now + self.config().scheduling.schedule_timeout())
                    .requeue_after(now),
                StepOutcome::Succeeded(output) => UnitUpdate::to(StepRunStatus::Succeeded)
                    .output(output.clone())
                    .finished_at(now),
                StepOutcome::Failed(error) | StepOutcome::Cancelled(error) => {
                    UnitUpdate::to(requested).error(error.clone()).finished_at(now)
                }
            };

            let from = [step.status];
            let Some(updated) = self
                .persist(|| runs.transition_step_run(id, &from, &update))
                .await?
            else {
                continue;
            };
            self.emit_step(&updated);

            if retrying {
                tracing::info!(
                    step_run_id = %id,
                    retry = updated.retry_count,
                    max_retries = updated.max_retries,
                    "step run failed, retrying"
                );
                return Ok(StepTransition::Retrying(updated));
            }

            tracing::info!(step_run_id = %id, status = ?requested, "step run finished");
            self.record(
                AnalyticsKind::StepRunFinished,
                updated.id,
                updated.workflow_run_id,
                updated.status,
                updated.error.clone(),
                now,
            );
            self.after_step_finished(&updated).await?;
            return Ok(StepTransition::Applied(updated));
        }

        Err(EngineError::Conflict(format!("step run {id} changed concurrently")))
    }

    /// ASSIGNED -> PENDING_ASSIGNMENT, releasing the slot. The worker's later
    /// start attempt fails with `StepRunIsNotAssigned`.
    pub async fn unassign_step_run(&self, id: &Uuid) -> Result<StepRun, EngineError> {
        let now = Utc::now();
        let update = UnitUpdate::to(StepRunStatus::PendingAssignment)
            .clearing_assignment()
            .schedule_timeout_at(now + self.config().scheduling.schedule_timeout())
            .requeue_after(now);
        let runs = self.store().runs();
        let unassigned = self
            .persist(|| runs.transition_step_run(id, &[StepRunStatus::Assigned], &update))
            .await?
            .ok_or(EngineError::StepRunIsNotAssigned(*id))?;
        tracing::debug!(step_run_id = %id, "step run unassigned");
        self.emit_step(&unassigned);
        Ok(unassigned)
    }

    /// Whether an in-flight step run should stop: it was cancelled, or its
    /// workflow run is final.
    pub async fn step_run_should_cancel(&self, id: &Uuid) -> Result<bool, EngineError> {
        let step = self.get_step_run(id).await?;
        if step.status == StepRunStatus::Cancelled {
            return Ok(true);
        }
        let run = self.get_workflow_run(&step.workflow_run_id).await?;
        Ok(run.status.is_terminal() && !step.status.is_terminal())
    }

    // -----------------------------------------------------------------------
    // Cascade
    // -----------------------------------------------------------------------

    /// Queue children a success unblocked, or cancel unstarted siblings after
    /// a failure, then resolve the job.
    async fn after_step_finished(&self, step: &StepRun) -> Result<(), EngineError> {
        let runs = self.store().runs();
        let siblings = self.persist(|| runs.list_step_runs_for_job(&step.job_run_id)).await?;

        if step.status == StepRunStatus::Succeeded {
            let children = siblings
                .iter()
                .filter(|s| s.status == StepRunStatus::Pending && s.parent_ids.contains(&step.id));
            for child in children {
                match self.gate_parents(child, &siblings) {
                    ParentGate::Ready => match self.enqueue_step_run(&child.id).await {
                        Ok(_) | Err(EngineError::StepRunIsNotPending(_)) => {}
                        Err(e) => return Err(e),
                    },
                    ParentGate::ShortCircuit => self.short_circuit(child).await?,
                    ParentGate::Wait => {}
                }
            }
        } else {
            let unstarted: Vec<Uuid> = siblings
                .iter()
                .filter(|s| s.id != step.id && StepRunStatus::NOT_STARTED.contains(&s.status))
                .map(|s| s.id)
                .collect();
            if !unstarted.is_empty() {
                let reason = format!("step '{}' did not succeed", step.step_name);
                self.cancel_unstarted(step.workflow_run_id, &unstarted, &reason).await?;
            }
        }

        self.resolve_job_run(&step.job_run_id).await
    }

    fn gate_parents(&self, step: &StepRun, siblings: &[StepRun]) -> ParentGate {
        let parents: Vec<StepRunStatus> = siblings
            .iter()
            .filter(|s| step.parent_ids.contains(&s.id))
            .map(|s| s.status)
            .collect();
        parent_gate(&parents)
    }

    async fn short_circuit(&self, step: &StepRun) -> Result<(), EngineError> {
        let reason = "a parent step did not succeed";
        self.cancel_unstarted(step.workflow_run_id, &[step.id], reason).await
    }

    /// Bulk-cancel step runs that have not started. Slots held by ASSIGNED
    /// ones are released with the write.
    pub(crate) async fn cancel_unstarted(
        &self,
        workflow_run_id: Uuid,
        ids: &[Uuid],
        reason: &str,
    ) -> Result<(), EngineError> {
        let runs = self.store().runs();
        let now = Utc::now();
        let cancelled = self
            .persist(|| runs.cancel_step_runs(ids, &StepRunStatus::NOT_STARTED, reason, now))
            .await?;
        for step_run_id in cancelled {
            self.record(
                AnalyticsKind::StepRunFinished,
                step_run_id,
                workflow_run_id,
                StepRunStatus::Cancelled,
                Some(reason.to_string()),
                now,
            );
            self.emit(EngineEvent::StepRunStatusChanged {
                step_run_id,
                workflow_run_id,
                status: StepRunStatus::Cancelled,
            });
        }
        Ok(())
    }

    pub(crate) fn emit_step(&self, step: &StepRun) {
        self.emit(EngineEvent::StepRunStatusChanged {
            step_run_id: step.id,
            workflow_run_id: step.workflow_run_id,
            status: step.status,
        });
    }
}
