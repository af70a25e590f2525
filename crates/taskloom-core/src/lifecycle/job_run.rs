//! Job-run transitions. Jobs have no retry substate: they start with their
//! first step and become final when every step is final.

use chrono::Utc;
use taskloom_types::run::{JobRun, JobRunStatus};
use uuid::Uuid;

use super::transition::resolve_job_status;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::repository::{RunRepository, Store};

impl<S: Store> Engine<S> {
    pub async fn list_job_runs(&self, workflow_run_id: &Uuid) -> Result<Vec<JobRun>, EngineError> {
        let runs = self.store().runs();
        self.persist(|| runs.list_job_runs(workflow_run_id)).await
    }

    /// PENDING -> RUNNING. A job that already left PENDING is left alone.
    pub(crate) async fn start_job_run(&self, id: &Uuid) -> Result<(), EngineError> {
        let runs = self.store().runs();
        let now = Utc::now();
        let started = self
            .persist(|| runs.transition_job_run(id, &[JobRunStatus::Pending], JobRunStatus::Running, now))
            .await?;
        if started.is_some() {
            tracing::debug!(job_run_id = %id, "job run started");
        }
        Ok(())
    }

    /// Finalize the job if every step is final, then resolve its workflow run.
    pub(crate) async fn resolve_job_run(&self, id: &Uuid) -> Result<(), EngineError> {
        let runs = self.store().runs();
        let steps = self.persist(|| runs.list_step_runs_for_job(id)).await?;
        let statuses: Vec<_> = steps.iter().map(|s| s.status).collect();
        let Some(status) = resolve_job_status(&statuses) else {
            return Ok(());
        };

        let now = Utc::now();
        let finished = self
            .persist(|| runs.transition_job_run(id, &JobRunStatus::ACTIVE, status, now))
            .await?;
        match finished {
            Some(job) => {
                tracing::debug!(job_run_id = %id, job = %job.job_name, status = ?status, "job run finished");
                self.resolve_workflow_run(&job.workflow_run_id).await
            }
            // Another coordinator finalized it and resolves the workflow run.
            None => Ok(()),
        }
    }
}
