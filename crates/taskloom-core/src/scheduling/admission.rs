//! Concurrency admission controller.
//!
//! Decides whether a workflow run sharing a concurrency key may start. The
//! decision functions are pure; the engine applies each decision as one
//! atomic [`AdmissionPlan`] whose store-side capacity check makes two
//! coordinators admitting into the same group produce one winner. A plan
//! that loses is re-decided from fresh state.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use taskloom_types::error::RepositoryError;
use taskloom_types::event::{AnalyticsKind, EngineEvent};
use taskloom_types::run::{JobKind, StepRunStatus, WorkflowRun, WorkflowRunStatus};
use taskloom_types::workflow::{ConcurrencyConfig, LimitStrategy};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::repository::run::{AdmissionPlan, AdmissionScope, WorkflowRunFilter, WorkflowRunUpdate};
use crate::repository::{RunRepository, SortOrder, Store, WorkflowRepository};

/// Attempts at applying a plan before giving up on contention.
const ADMISSION_ATTEMPTS: u32 = 3;

/// What to do with a candidate run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Start the candidate, cancelling `cancelled` first to make room.
    Admit { cancelled: Vec<Uuid> },
    /// Hold the candidate in QUEUED.
    Queue,
    /// Drop the candidate. It never starts.
    Reject { existing_run_id: Option<Uuid> },
}

/// Result of [`Engine::admit_workflow_run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Started { cancelled: Vec<Uuid> },
    Queued,
    Dropped { existing_run_id: Option<Uuid> },
    /// The run had already left PENDING.
    AlreadyDecided(WorkflowRunStatus),
}

// ---------------------------------------------------------------------------
// Pure decisions
// ---------------------------------------------------------------------------

/// Decide admission for one candidate.
///
/// `running` lists the RUNNING runs it competes with, oldest first.
/// `queued_ahead` counts QUEUED runs that arrived before it; queueing
/// strategies never let a newcomer overtake them.
pub fn decide(strategy: LimitStrategy, max_runs: u32, running: &[Uuid], queued_ahead: usize) -> Admission {
    let max = max_runs.max(1) as usize;
    let has_room = running.len() < max;

    match strategy {
        LimitStrategy::CancelInProgress if has_room => Admission::Admit { cancelled: vec![] },
        LimitStrategy::CancelInProgress => {
            let excess = running.len() + 1 - max;
            Admission::Admit {
                cancelled: running[..excess].to_vec(),
            }
        }
        LimitStrategy::DropNewest if has_room => Admission::Admit { cancelled: vec![] },
        LimitStrategy::DropNewest => Admission::Reject {
            existing_run_id: running.first().copied(),
        },
        LimitStrategy::QueueNewest | LimitStrategy::GroupRoundRobin => {
            if has_room && queued_ahead == 0 {
                Admission::Admit { cancelled: vec![] }
            } else {
                Admission::Queue
            }
        }
    }
}

/// Pop queued runs of one workflow with a capacity per group key.
///
/// `queued` is every QUEUED run of the workflow in arrival order. Groups are
/// visited in rotation, starting with the one whose head arrived first, and
/// each visit takes the group's next run if the group has room. Groups at
/// capacity are skipped.
pub fn pop_round_robin(
    queued: &[(Uuid, String)],
    running_per_group: &HashMap<String, u32>,
    max_runs: u32,
) -> Vec<(String, Vec<Uuid>)> {
    let mut queues = group_queues(queued);
    let mut popped: Vec<(String, Vec<Uuid>)> = Vec::new();

    loop {
        let mut progressed = false;
        for (key, queue) in queues.iter_mut() {
            let already = popped
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, ids)| ids.len() as u32)
                .unwrap_or(0);
            let running = running_per_group.get(key).copied().unwrap_or(0);
            if running + already >= max_runs {
                continue;
            }
            let Some(id) = queue.pop_front() else {
                continue;
            };
            match popped.iter_mut().find(|(k, _)| k == key) {
                Some((_, ids)) => ids.push(id),
                None => popped.push((key.clone(), vec![id])),
            }
            progressed = true;
        }
        if !progressed {
            return popped;
        }
    }
}

/// Pop queued runs of one workflow sharing one capacity across all keys.
///
/// Rotation advances by key, so a burst under one key cannot take the whole
/// budget while other keys wait. Keys with fewer running runs are visited
/// first, ties broken by the arrival of the key's head. Within a key, runs
/// leave in arrival order.
pub fn pop_group_round_robin(
    queued: &[(Uuid, String)],
    running_per_group: &HashMap<String, u32>,
    max_runs: u32,
) -> Vec<Uuid> {
    let running_total: u32 = running_per_group.values().sum();
    let mut budget = max_runs.saturating_sub(running_total);
    let mut queues = group_queues(queued);
    queues.sort_by_key(|(key, _)| running_per_group.get(key).copied().unwrap_or(0));
    let mut popped = Vec::new();

    while budget > 0 {
        let mut progressed = false;
        for (_, queue) in queues.iter_mut() {
            if budget == 0 {
                break;
            }
            if let Some(id) = queue.pop_front() {
                popped.push(id);
                budget -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    popped
}

/// Per-key FIFO queues, ordered by the arrival of each key's first run.
fn group_queues(queued: &[(Uuid, String)]) -> Vec<(String, VecDeque<Uuid>)> {
    let mut queues: Vec<(String, VecDeque<Uuid>)> = Vec::new();
    for (id, key) in queued {
        match queues.iter_mut().find(|(k, _)| k == key) {
            Some((_, queue)) => queue.push_back(*id),
            None => queues.push((key.clone(), VecDeque::from([*id]))),
        }
    }
    queues
}

// ---------------------------------------------------------------------------
// Engine operations
// ---------------------------------------------------------------------------

impl<S: Store> Engine<S> {
    /// Admit a PENDING workflow run under its workflow's concurrency limit.
    ///
    /// Runs of workflows without a concurrency declaration start directly.
    /// A run with a concurrency declaration must already carry its evaluated
    /// group key.
    pub async fn admit_workflow_run(&self, id: &Uuid) -> Result<AdmissionOutcome, EngineError> {
        let mut attempt = 1;
        loop {
            let run = self.get_workflow_run(id).await?;
            if run.status != WorkflowRunStatus::Pending {
                return Ok(AdmissionOutcome::AlreadyDecided(run.status));
            }
            let Some(concurrency) = self.concurrency_of(&run).await? else {
                return self.start_unlimited(&run).await;
            };
            let key = run.concurrency_group_key.clone().ok_or_else(|| {
                EngineError::Conflict(format!("workflow run {id} has no evaluated group key yet"))
            })?;

            let scope = admission_scope(&concurrency, run.workflow_id, &key);
            let running = self.runs_in_scope(&scope, WorkflowRunStatus::Running).await?;
            let queued = self.runs_in_scope(&scope, WorkflowRunStatus::Queued).await?;
            let running_ids: Vec<Uuid> = running.iter().map(|r| r.id).collect();
            let decision = decide(concurrency.limit_strategy, concurrency.max_runs, &running_ids, queued.len());

            let mut plan = AdmissionPlan {
                scope,
                max_runs: concurrency.max_runs,
                start: vec![],
                queue: vec![],
                cancel: vec![],
                drop: vec![],
                at: Utc::now(),
            };
            match &decision {
                Admission::Admit { cancelled } => {
                    plan.start.push(run.id);
                    plan.cancel.extend(cancelled);
                }
                Admission::Queue => plan.queue.push(run.id),
                Admission::Reject { .. } => plan.drop.push(run.id),
            }

            let runs = self.store().runs();
            match self.persist(|| runs.apply_admission(&plan)).await {
                Ok(()) => {}
                Err(EngineError::Repository(RepositoryError::Conflict(reason))) if attempt < ADMISSION_ATTEMPTS => {
                    tracing::debug!(workflow_run_id = %id, attempt, %reason, "admission plan lost a race");
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            return match decision {
                Admission::Admit { cancelled } => {
                    for cancelled_id in &cancelled {
                        self.settle_cancelled_by_admission(cancelled_id).await?;
                    }
                    tracing::info!(workflow_run_id = %id, %key, cancelled = cancelled.len(), "workflow run admitted");
                    self.run_started(id).await?;
                    Ok(AdmissionOutcome::Started { cancelled })
                }
                Admission::Queue => {
                    tracing::info!(workflow_run_id = %id, %key, "workflow run queued");
                    self.emit(EngineEvent::WorkflowRunStatusChanged {
                        workflow_run_id: *id,
                        status: WorkflowRunStatus::Queued,
                    });
                    // A run may have finished between the read and the write.
                    self.pop_queued_runs(run.workflow_id, &concurrency).await?;
                    Ok(AdmissionOutcome::Queued)
                }
                Admission::Reject { existing_run_id } => {
                    tracing::info!(workflow_run_id = %id, %key, "workflow run dropped at concurrency limit");
                    let dropped = self.get_workflow_run(id).await?;
                    self.record(
                        AnalyticsKind::AdmissionDropped,
                        dropped.id,
                        dropped.id,
                        dropped.status,
                        dropped.error.clone(),
                        plan.at,
                    );
                    self.emit(EngineEvent::WorkflowRunStatusChanged {
                        workflow_run_id: *id,
                        status: dropped.status,
                    });
                    self.cancel_run_work(&dropped, "dropped at concurrency limit").await?;
                    Ok(AdmissionOutcome::Dropped { existing_run_id })
                }
            };
        }
    }

    /// Start queued runs of a workflow as capacity allows. Returns the runs started.
    pub async fn pop_queued_runs(
        &self,
        workflow_id: Uuid,
        concurrency: &ConcurrencyConfig,
    ) -> Result<Vec<Uuid>, EngineError> {
        let mut started = Vec::new();
        match concurrency.limit_strategy {
            LimitStrategy::QueueNewest => {
                let scope = AdmissionScope::Workflow { workflow_id };
                let queued = self.runs_in_scope(&scope, WorkflowRunStatus::Queued).await?;
                let running = self.runs_in_scope(&scope, WorkflowRunStatus::Running).await?;
                let per_group = running_per_group(&running);
                for (key, ids) in pop_round_robin(&keyed(&queued), &per_group, concurrency.max_runs) {
                    let scope = AdmissionScope::Group { workflow_id, key };
                    started.extend(self.apply_pop(scope, concurrency.max_runs, ids).await?);
                }
            }
            LimitStrategy::GroupRoundRobin => {
                let scope = AdmissionScope::Workflow { workflow_id };
                let queued = self.runs_in_scope(&scope, WorkflowRunStatus::Queued).await?;
                let running = self.runs_in_scope(&scope, WorkflowRunStatus::Running).await?;
                let ids = pop_group_round_robin(&keyed(&queued), &running_per_group(&running), concurrency.max_runs);
                started.extend(self.apply_pop(scope, concurrency.max_runs, ids).await?);
            }
            LimitStrategy::CancelInProgress | LimitStrategy::DropNewest => {}
        }
        Ok(started)
    }

    /// Let queued runs in after `run` became final.
    pub(crate) async fn release_concurrency(&self, run: &WorkflowRun) -> Result<(), EngineError> {
        if let Some(concurrency) = self.concurrency_of(run).await? {
            let started = self.pop_queued_runs(run.workflow_id, &concurrency).await?;
            if !started.is_empty() {
                tracing::debug!(workflow_id = %run.workflow_id, started = started.len(), "queued runs admitted");
            }
        }
        Ok(())
    }

    /// Apply one pop plan. A lost race leaves the runs QUEUED for the next
    /// release, which re-reads capacity.
    async fn apply_pop(&self, scope: AdmissionScope, max_runs: u32, ids: Vec<Uuid>) -> Result<Vec<Uuid>, EngineError> {
        if ids.is_empty() {
            return Ok(ids);
        }
        let plan = AdmissionPlan {
            scope,
            max_runs,
            start: ids,
            queue: vec![],
            cancel: vec![],
            drop: vec![],
            at: Utc::now(),
        };
        let runs = self.store().runs();
        match self.persist(|| runs.apply_admission(&plan)).await {
            Ok(()) => {}
            Err(EngineError::Repository(RepositoryError::Conflict(reason))) => {
                tracing::debug!(%reason, "pop plan lost a race");
                return Ok(vec![]);
            }
            Err(e) => return Err(e),
        }
        for id in &plan.start {
            self.run_started(id).await?;
        }
        Ok(plan.start)
    }

    async fn start_unlimited(&self, run: &WorkflowRun) -> Result<AdmissionOutcome, EngineError> {
        let runs = self.store().runs();
        let update = WorkflowRunUpdate {
            status: WorkflowRunStatus::Running,
            error: None,
            at: Utc::now(),
        };
        let started = self
            .persist(|| runs.transition_workflow_run(&run.id, &[WorkflowRunStatus::Pending], &update))
            .await?;
        match started {
            Some(_) => {
                self.run_started(&run.id).await?;
                Ok(AdmissionOutcome::Started { cancelled: vec![] })
            }
            None => {
                let current = self.get_workflow_run(&run.id).await?;
                Ok(AdmissionOutcome::AlreadyDecided(current.status))
            }
        }
    }

    /// Queue the root steps of every default job of a run that just started.
    async fn run_started(&self, id: &Uuid) -> Result<(), EngineError> {
        self.emit(EngineEvent::WorkflowRunStatusChanged {
            workflow_run_id: *id,
            status: WorkflowRunStatus::Running,
        });
        let runs = self.store().runs();
        let jobs = self.persist(|| runs.list_job_runs(id)).await?;
        for job in jobs.iter().filter(|j| j.kind == JobKind::Default) {
            let steps = self.persist(|| runs.list_step_runs_for_job(&job.id)).await?;
            for root in steps.iter().filter(|s| s.is_root() && s.status == StepRunStatus::Pending) {
                match self.enqueue_step_run(&root.id).await {
                    Ok(_) | Err(EngineError::StepRunIsNotPending(_)) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    /// A RUNNING run the plan cancelled: announce it and stop its pending work.
    async fn settle_cancelled_by_admission(&self, id: &Uuid) -> Result<(), EngineError> {
        let cancelled = self.get_workflow_run(id).await?;
        tracing::info!(workflow_run_id = %id, "workflow run cancelled to admit a newer run");
        self.record(
            AnalyticsKind::WorkflowRunFinished,
            cancelled.id,
            cancelled.id,
            cancelled.status,
            cancelled.error.clone(),
            cancelled.finished_at.unwrap_or_else(Utc::now),
        );
        self.emit(EngineEvent::WorkflowRunStatusChanged {
            workflow_run_id: *id,
            status: cancelled.status,
        });
        self.cancel_run_work(&cancelled, "cancelled by a newer run in its concurrency group")
            .await
    }

    async fn concurrency_of(&self, run: &WorkflowRun) -> Result<Option<ConcurrencyConfig>, EngineError> {
        let workflows = self.store().workflows();
        let version = self
            .persist(|| workflows.get_version(&run.workflow_version_id))
            .await?
            .ok_or_else(|| EngineError::not_found("workflow version", &run.workflow_version_id))?;
        Ok(version.declaration.concurrency)
    }

    /// Runs in `scope` with `status`, oldest first.
    async fn runs_in_scope(
        &self,
        scope: &AdmissionScope,
        status: WorkflowRunStatus,
    ) -> Result<Vec<WorkflowRun>, EngineError> {
        let filter = match scope {
            AdmissionScope::Group { workflow_id, key } => WorkflowRunFilter {
                workflow_id: Some(*workflow_id),
                statuses: vec![status],
                group_key: Some(key.clone()),
                order: SortOrder::Asc,
                ..Default::default()
            },
            AdmissionScope::Workflow { workflow_id } => WorkflowRunFilter {
                workflow_id: Some(*workflow_id),
                statuses: vec![status],
                order: SortOrder::Asc,
                ..Default::default()
            },
        };
        self.list_workflow_runs(&filter).await
    }
}

fn admission_scope(concurrency: &ConcurrencyConfig, workflow_id: Uuid, key: &str) -> AdmissionScope {
    match concurrency.limit_strategy {
        LimitStrategy::GroupRoundRobin => AdmissionScope::Workflow { workflow_id },
        _ => AdmissionScope::Group {
            workflow_id,
            key: key.to_string(),
        },
    }
}

fn running_per_group(running: &[WorkflowRun]) -> HashMap<String, u32> {
    let mut per_group: HashMap<String, u32> = HashMap::new();
    for run in running {
        if let Some(key) = &run.concurrency_group_key {
            *per_group.entry(key.clone()).or_insert(0) += 1;
        }
    }
    per_group
}

fn keyed(runs: &[WorkflowRun]) -> Vec<(Uuid, String)> {
    runs.iter()
        .filter_map(|r| r.concurrency_group_key.clone().map(|k| (r.id, k)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::now_v7()).collect()
    }

    #[test]
    fn test_room_admits_under_every_strategy() {
        let running = ids(1);
        for strategy in [
            LimitStrategy::CancelInProgress,
            LimitStrategy::DropNewest,
            LimitStrategy::QueueNewest,
            LimitStrategy::GroupRoundRobin,
        ] {
            assert_eq!(
                decide(strategy, 2, &running, 0),
                Admission::Admit { cancelled: vec![] }
            );
        }
    }

    #[test]
    fn test_cancel_in_progress_cancels_oldest() {
        let running = ids(2);
        assert_eq!(
            decide(LimitStrategy::CancelInProgress, 1, &running[..1], 0),
            Admission::Admit {
                cancelled: vec![running[0]]
            }
        );
        assert_eq!(
            decide(LimitStrategy::CancelInProgress, 2, &running, 0),
            Admission::Admit {
                cancelled: vec![running[0]]
            }
        );
    }

    #[test]
    fn test_drop_newest_rejects_and_names_existing() {
        let running = ids(1);
        assert_eq!(
            decide(LimitStrategy::DropNewest, 1, &running, 0),
            Admission::Reject {
                existing_run_id: Some(running[0])
            }
        );
    }

    #[test]
    fn test_queueing_never_overtakes_waiting_runs() {
        assert_eq!(decide(LimitStrategy::QueueNewest, 1, &ids(1), 0), Admission::Queue);
        assert_eq!(decide(LimitStrategy::QueueNewest, 2, &ids(1), 1), Admission::Queue);
        assert_eq!(decide(LimitStrategy::GroupRoundRobin, 2, &[], 3), Admission::Queue);
    }

    #[test]
    fn test_pop_round_robin_respects_per_group_capacity() {
        let q = ids(5);
        let queued = vec![
            (q[0], "a".to_string()),
            (q[1], "a".to_string()),
            (q[2], "b".to_string()),
            (q[3], "a".to_string()),
            (q[4], "c".to_string()),
        ];
        let mut running = HashMap::new();
        running.insert("c".to_string(), 2);

        let popped = pop_round_robin(&queued, &running, 2);
        assert_eq!(
            popped,
            vec![("a".to_string(), vec![q[0], q[1]]), ("b".to_string(), vec![q[2]])]
        );
    }

    #[test]
    fn test_group_round_robin_is_fair_across_keys() {
        let q = ids(6);
        // A burst under "a" arrives before anything under "b" or "c".
        let queued = vec![
            (q[0], "a".to_string()),
            (q[1], "a".to_string()),
            (q[2], "a".to_string()),
            (q[3], "b".to_string()),
            (q[4], "c".to_string()),
            (q[5], "b".to_string()),
        ];
        let idle = HashMap::new();
        assert_eq!(pop_group_round_robin(&queued, &idle, 3), vec![q[0], q[3], q[4]]);

        let mut running = HashMap::new();
        running.insert("z".to_string(), 1);
        assert_eq!(pop_group_round_robin(&queued, &running, 5), vec![q[0], q[3], q[4], q[1]]);

        running.insert("z".to_string(), 3);
        assert!(pop_group_round_robin(&queued, &running, 3).is_empty());
    }

    #[test]
    fn test_group_round_robin_serves_idle_keys_first() {
        let q = ids(3);
        let queued = vec![
            (q[0], "a".to_string()),
            (q[1], "a".to_string()),
            (q[2], "b".to_string()),
        ];
        let mut running = HashMap::new();
        running.insert("a".to_string(), 1);
        assert_eq!(pop_group_round_robin(&queued, &running, 2), vec![q[2]]);
    }
}
