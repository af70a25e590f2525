//! Manual replay of a finished step run.
//!
//! A replay resets the target and everything downstream of it in its job,
//! then queues the target again. It is allowed only when the target and
//! every descendant are final: a running child may still be reading the
//! output the replay would discard.

use chrono::Utc;
use serde_json::Value;
use taskloom_types::event::EngineEvent;
use taskloom_types::run::{StepRun, WorkflowRunStatus};
use uuid::Uuid;

use super::dag::descendants;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::repository::run::ReplayReset;
use crate::repository::{RunRepository, Store};

/// Check that `target` may be replayed. Returns the ids to reset, target
/// first, then its descendants in breadth-first order.
pub fn preflight(target: &StepRun, steps_in_job: &[StepRun]) -> Result<Vec<Uuid>, EngineError> {
    if !target.status.is_terminal() {
        return Err(EngineError::PreflightReplayStepRunNotInFinalState(target.id));
    }
    let downstream = descendants(target.id, steps_in_job);
    if let Some(child) = downstream
        .iter()
        .filter_map(|id| steps_in_job.iter().find(|s| s.id == *id))
        .find(|s| !s.status.is_terminal())
    {
        return Err(EngineError::PreflightReplayChildStepRunNotInFinalState {
            parent: target.id,
            child: child.id,
        });
    }

    let mut ids = Vec::with_capacity(downstream.len() + 1);
    ids.push(target.id);
    ids.extend(downstream);
    Ok(ids)
}

impl<S: Store> Engine<S> {
    /// Replay a final step run, optionally with new input.
    ///
    /// The job run and workflow run return to RUNNING without passing
    /// admission again.
    pub async fn replay_step_run(&self, id: &Uuid, input: Option<Value>) -> Result<StepRun, EngineError> {
        let target = self.get_step_run(id).await?;
        let runs = self.store().runs();
        let steps = self.persist(|| runs.list_step_runs_for_job(&target.job_run_id)).await?;
        let step_run_ids = preflight(&target, &steps)?;

        let reset = ReplayReset {
            workflow_run_id: target.workflow_run_id,
            job_run_id: target.job_run_id,
            target_id: target.id,
            step_run_ids,
            input,
            at: Utc::now(),
        };
        // Loses only to a concurrent replay or a write that un-finalized a step.
        self.persist(|| runs.reset_for_replay(&reset)).await?;
        tracing::info!(
            step_run_id = %id,
            workflow_run_id = %target.workflow_run_id,
            reset = reset.step_run_ids.len(),
            "step run replayed"
        );
        self.emit(EngineEvent::WorkflowRunStatusChanged {
            workflow_run_id: target.workflow_run_id,
            status: WorkflowRunStatus::Running,
        });
        self.enqueue_step_run(id).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use taskloom_types::run::StepRunStatus;

    use super::*;

    fn step(name: &str, status: StepRunStatus, parents: &[&StepRun]) -> StepRun {
        StepRun {
            id: Uuid::now_v7(),
            workflow_run_id: Uuid::nil(),
            job_run_id: Uuid::nil(),
            step_name: name.to_string(),
            action_id: "act".to_string(),
            status,
            parent_ids: parents.iter().map(|p| p.id).collect(),
            input: serde_json::json!({}),
            output: None,
            error: None,
            priority: 1,
            retry_count: 0,
            max_retries: 0,
            requeue_count: 0,
            timeout_secs: None,
            schedule_timeout_at: None,
            timeout_at: None,
            requeue_after: None,
            worker_id: None,
            dispatcher_id: None,
            assigned_at: None,
            slot_units: 1,
            rate_limits: BTreeMap::new(),
            desired_labels: BTreeMap::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_target_must_be_final() {
        let target = step("a", StepRunStatus::Running, &[]);
        let err = preflight(&target, &[target.clone()]).unwrap_err();
        assert!(matches!(err, EngineError::PreflightReplayStepRunNotInFinalState(id) if id == target.id));
    }

    #[test]
    fn test_running_grandchild_blocks_replay() {
        let a = step("a", StepRunStatus::Succeeded, &[]);
        let b = step("b", StepRunStatus::Succeeded, &[&a]);
        let c = step("c", StepRunStatus::Running, &[&b]);
        let steps = vec![a.clone(), b.clone(), c.clone()];
        let err = preflight(&a, &steps).unwrap_err();
        assert!(matches!(
            err,
            EngineError::PreflightReplayChildStepRunNotInFinalState { parent, child }
                if parent == a.id && child == c.id
        ));
    }

    #[test]
    fn test_final_descendants_allow_replay_and_unrelated_steps_are_ignored() {
        let a = step("a", StepRunStatus::Failed, &[]);
        let b = step("b", StepRunStatus::Cancelled, &[&a]);
        let c = step("c", StepRunStatus::Cancelled, &[&b]);
        let unrelated = step("d", StepRunStatus::Running, &[]);
        let steps = vec![a.clone(), b.clone(), c.clone(), unrelated];
        let ids = preflight(&a, &steps).unwrap();
        assert_eq!(ids, vec![a.id, b.id, c.id]);
    }
}
