//! Workflow-run resolution and cancellation.
//!
//! A workflow run becomes final exactly when all of its default jobs are
//! final. When a default job failed and an on-failure job is declared, that
//! job runs first and the run is finalized after it.

use chrono::Utc;
use taskloom_types::event::{AnalyticsKind, EngineEvent};
use taskloom_types::run::{JobKind, JobRunStatus, StepRunStatus, WorkflowRun, WorkflowRunStatus};
use uuid::Uuid;

use super::transition::{TerminalWrite, WorkflowResolution, check_workflow_terminal_write, resolve_workflow};
use crate::engine::Engine;
use crate::error::EngineError;
use crate::repository::run::{WorkflowRunFilter, WorkflowRunUpdate};
use crate::repository::{RunRepository, Store};

impl<S: Store> Engine<S> {
    pub async fn get_workflow_run(&self, id: &Uuid) -> Result<WorkflowRun, EngineError> {
        let runs = self.store().runs();
        self.persist(|| runs.get_workflow_run(id))
            .await?
            .ok_or_else(|| EngineError::not_found("workflow run", id))
    }

    pub async fn list_workflow_runs(&self, filter: &WorkflowRunFilter) -> Result<Vec<WorkflowRun>, EngineError> {
        let runs = self.store().runs();
        self.persist(|| runs.list_workflow_runs(filter)).await
    }

    /// Cancel a workflow run.
    ///
    /// Steps that have not reached a worker are cancelled; ASSIGNED and
    /// RUNNING steps observe the cancellation through
    /// [`Engine::step_run_should_cancel`] and report back. Cancelling an
    /// already-cancelled run is a no-op; cancelling a run that finished
    /// otherwise fails with `AlreadyFinal`.
    pub async fn cancel_workflow_run(&self, id: &Uuid, reason: &str) -> Result<WorkflowRun, EngineError> {
        self.abort_workflow_run(id, WorkflowRunStatus::Cancelled, reason).await
    }

    /// Finalize a run from outside its jobs (cancellation, group-key
    /// failure) and cancel whatever work has not reached a worker.
    pub(crate) async fn abort_workflow_run(
        &self,
        id: &Uuid,
        status: WorkflowRunStatus,
        reason: &str,
    ) -> Result<WorkflowRun, EngineError> {
        let run = self.get_workflow_run(id).await?;
        if check_workflow_terminal_write(*id, run.status, status)? == TerminalWrite::NoOp {
            return Ok(run);
        }

        let runs = self.store().runs();
        let update = WorkflowRunUpdate {
            status,
            error: Some(reason.to_string()),
            at: Utc::now(),
        };
        let Some(aborted) = self
            .persist(|| runs.transition_workflow_run(id, &WorkflowRunStatus::ACTIVE, &update))
            .await?
        else {
            // Finished concurrently; report against what it became.
            let current = self.get_workflow_run(id).await?;
            check_workflow_terminal_write(*id, current.status, status)?;
            return Ok(current);
        };

        tracing::info!(workflow_run_id = %id, status = ?status, reason, "workflow run aborted");
        self.cancel_run_work(&aborted, reason).await?;
        self.workflow_run_finished(&aborted).await?;
        Ok(aborted)
    }

    /// Cancel every step and group-key run of a final workflow run that has
    /// not reached a worker, then settle its jobs.
    pub(crate) async fn cancel_run_work(&self, run: &WorkflowRun, reason: &str) -> Result<(), EngineError> {
        let runs = self.store().runs();
        let steps = self.persist(|| runs.list_step_runs_for_workflow_run(&run.id)).await?;
        let waiting: Vec<Uuid> = steps
            .iter()
            .filter(|s| matches!(s.status, StepRunStatus::Pending | StepRunStatus::PendingAssignment))
            .map(|s| s.id)
            .collect();
        if !waiting.is_empty() {
            self.cancel_unstarted(run.id, &waiting, reason).await?;
        }
        self.cancel_waiting_group_key_run(run, reason).await?;

        let jobs = self.persist(|| runs.list_job_runs(&run.id)).await?;
        for job in jobs.iter().filter(|j| !j.status.is_terminal()) {
            self.resolve_job_run(&job.id).await?;
        }
        Ok(())
    }

    /// Decide what a change in the run's jobs means for the run.
    pub(crate) async fn resolve_workflow_run(&self, id: &Uuid) -> Result<(), EngineError> {
        let run = self.get_workflow_run(id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }

        let runs = self.store().runs();
        let jobs = self.persist(|| runs.list_job_runs(id)).await?;
        let default: Vec<JobRunStatus> = jobs
            .iter()
            .filter(|j| j.kind == JobKind::Default)
            .map(|j| j.status)
            .collect();
        let on_failure = jobs.iter().find(|j| j.kind == JobKind::OnFailure);

        match resolve_workflow(&default, on_failure.map(|j| j.status)) {
            WorkflowResolution::Wait => Ok(()),
            WorkflowResolution::StartOnFailure => {
                let Some(job) = on_failure else {
                    return Ok(());
                };
                let steps = self.persist(|| runs.list_step_runs_for_job(&job.id)).await?;
                for root in steps.iter().filter(|s| s.is_root() && s.status == StepRunStatus::Pending) {
                    match self.enqueue_step_run(&root.id).await {
                        Ok(_) | Err(EngineError::StepRunIsNotPending(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                tracing::info!(workflow_run_id = %id, job = %job.job_name, "on-failure job triggered");
                Ok(())
            }
            WorkflowResolution::Finish {
                status,
                skip_on_failure,
            } => {
                if let Some(job) = on_failure.filter(|_| skip_on_failure) {
                    let steps = self.persist(|| runs.list_step_runs_for_job(&job.id)).await?;
                    let ids: Vec<Uuid> = steps.iter().map(|s| s.id).collect();
                    self.cancel_unstarted(*id, &ids, "on-failure job not needed").await?;
                    let now = Utc::now();
                    self.persist(|| {
                        runs.transition_job_run(&job.id, &[JobRunStatus::Pending], JobRunStatus::Cancelled, now)
                    })
                    .await?;
                }

                let error = jobs
                    .iter()
                    .find(|j| j.kind == JobKind::Default && j.status == JobRunStatus::Failed)
                    .map(|j| format!("job '{}' failed", j.job_name));
                self.finish_workflow_run(id, status, error).await
            }
        }
    }

    async fn finish_workflow_run(
        &self,
        id: &Uuid,
        status: WorkflowRunStatus,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let runs = self.store().runs();
        let update = WorkflowRunUpdate {
            status,
            error,
            at: Utc::now(),
        };
        let finished = self
            .persist(|| runs.transition_workflow_run(id, &WorkflowRunStatus::ACTIVE, &update))
            .await?;
        match finished {
            Some(run) => {
                tracing::info!(workflow_run_id = %id, status = ?status, "workflow run finished");
                self.workflow_run_finished(&run).await
            }
            None => Ok(()),
        }
    }

    /// Announce a final run and let queued runs of its workflow in.
    async fn workflow_run_finished(&self, run: &WorkflowRun) -> Result<(), EngineError> {
        self.record(
            AnalyticsKind::WorkflowRunFinished,
            run.id,
            run.id,
            run.status,
            run.error.clone(),
            run.finished_at.unwrap_or_else(Utc::now),
        );
        self.emit(EngineEvent::WorkflowRunStatusChanged {
            workflow_run_id: run.id,
            status: run.status,
        });
        self.release_concurrency(run).await
    }
}
