//! Worker slot allocator.
//!
//! Binds a PENDING_ASSIGNMENT step run or group-key run to one worker
//! without oversubscribing it. Candidates are filtered and ranked in memory
//! by [`rank_workers`]; the binding itself is one conditional store write
//! that re-checks capacity and draws rate-limit units, so a ranking built
//! from stale counts can lose a race but never oversubscribe.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use taskloom_types::event::EngineEvent;
use taskloom_types::run::{GetGroupKeyRun, StepRun, StepRunStatus, UnitKind, WorkflowRun};
use taskloom_types::worker::{DesiredLabel, WorkerCapacity};
use taskloom_types::workflow::StickyStrategy;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, ErrorKind};
use crate::repository::run::{AssignOutcome, SlotRequest, UnitUpdate};
use crate::repository::{RunRepository, Store, WorkerRepository, WorkflowRepository};

/// What a unit needs from a worker.
#[derive(Debug, Clone)]
pub struct Placement<'a> {
    pub action: &'a str,
    pub units: u32,
    pub desired_labels: &'a BTreeMap<String, DesiredLabel>,
    /// The workflow's sticky strategy and the worker the run is pinned to.
    pub sticky: Option<(StickyStrategy, Uuid)>,
}

/// The worker a unit was bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub worker_id: Uuid,
    pub dispatcher_id: Option<Uuid>,
}

/// Counts from one [`Engine::run_assignment_pass`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentReport {
    pub assigned: usize,
    pub no_worker: usize,
    pub rate_limited: usize,
    pub conflicts: usize,
    /// Units cancelled because their workflow run was already final.
    pub cancelled: usize,
    pub errors: usize,
}

/// Filter `candidates` down to the workers that can take the unit and order
/// them best first.
///
/// A worker qualifies when it is alive, declares the action, has `units`
/// free slots, satisfies every required label and, under hard stickiness,
/// is the pinned worker. Qualifying workers are ordered by soft sticky
/// preference, then summed weight of satisfied labels, then free slots,
/// then id, so identical worker state always yields the same order.
pub fn rank_workers(
    candidates: Vec<WorkerCapacity>,
    placement: &Placement<'_>,
    heartbeat_after: DateTime<Utc>,
) -> Vec<WorkerCapacity> {
    let mut ranked: Vec<(bool, i64, WorkerCapacity)> = candidates
        .into_iter()
        .filter(|c| c.worker.is_alive(heartbeat_after))
        .filter(|c| c.worker.declares_action(placement.action))
        .filter(|c| c.free_slots() >= placement.units)
        .filter(|c| match placement.sticky {
            Some((StickyStrategy::Hard, pinned)) => c.worker.id == pinned,
            _ => true,
        })
        .filter_map(|c| {
            let weight = label_weight(&c, placement.desired_labels)?;
            let preferred = matches!(placement.sticky, Some((StickyStrategy::Soft, pinned)) if pinned == c.worker.id);
            Some((preferred, weight, c))
        })
        .collect();

    ranked.sort_by(|(a_pref, a_weight, a), (b_pref, b_weight, b)| {
        b_pref
            .cmp(a_pref)
            .then(b_weight.cmp(a_weight))
            .then(b.free_slots().cmp(&a.free_slots()))
            .then(a.worker.id.cmp(&b.worker.id))
    });
    ranked.into_iter().map(|(_, _, c)| c).collect()
}

/// Summed weight of the satisfied labels, or `None` if a required one fails.
fn label_weight(candidate: &WorkerCapacity, desired: &BTreeMap<String, DesiredLabel>) -> Option<i64> {
    let mut weight = 0i64;
    for (key, label) in desired {
        let satisfied = candidate
            .worker
            .labels
            .get(key)
            .is_some_and(|actual| label.comparator.matches(actual, &label.value));
        if satisfied {
            weight += i64::from(label.weight);
        } else if label.required {
            return None;
        }
    }
    Some(weight)
}

impl<S: Store> Engine<S> {
    /// Bind a PENDING_ASSIGNMENT step run to the best qualifying worker.
    ///
    /// Fails with `NoWorkerAvailable` or `RateLimitExceeded` and leaves the
    /// step queued, deferred by the requeue backoff.
    pub async fn assign_step_run(&self, id: &Uuid) -> Result<Assignment, EngineError> {
        let step = self.get_step_run(id).await?;
        let mut run = self.get_workflow_run(&step.workflow_run_id).await?;
        let sticky = self.sticky_strategy(&run).await?;
        self.assign_step(&step, &mut run, sticky).await
    }

    /// Bind a PENDING_ASSIGNMENT group-key run to a worker declaring its action.
    pub async fn assign_group_key_run(&self, id: &Uuid) -> Result<Assignment, EngineError> {
        let group_key_run = self.get_group_key_run(id).await?;
        self.assign_group_key(&group_key_run).await
    }

    /// Release the worker slot held for a step run. Only the first call for
    /// a held slot returns `true`.
    pub async fn release_step_run_slot(&self, id: &Uuid) -> Result<bool, EngineError> {
        let runs = self.store().runs();
        let released = self.persist(|| runs.release_slot(id)).await?;
        if released {
            tracing::debug!(step_run_id = %id, "worker slot released");
        }
        Ok(released)
    }

    /// Try to assign every unit that is due, group-key runs first.
    pub async fn run_assignment_pass(&self, now: DateTime<Utc>) -> Result<AssignmentReport, EngineError> {
        let limit = self.config().scheduling.assign_batch_size;
        let runs = self.store().runs();
        let mut report = AssignmentReport::default();
        let mut workflow_runs: HashMap<Uuid, WorkflowRun> = HashMap::new();
        let mut sticky: HashMap<Uuid, Option<StickyStrategy>> = HashMap::new();

        let group_key_runs = self.persist(|| runs.list_assignable_group_key_runs(now, limit)).await?;
        for group_key_run in &group_key_runs {
            let run = self.cached_run(&mut workflow_runs, &group_key_run.workflow_run_id).await?;
            if run.status.is_terminal() {
                self.cancel_waiting_group_key_run(run, "workflow run is already final").await?;
                report.cancelled += 1;
                continue;
            }
            let result = self.assign_group_key(group_key_run).await;
            tally(&mut report, group_key_run.id, result);
        }

        let steps = self.persist(|| runs.list_assignable_step_runs(now, limit)).await?;
        for step in &steps {
            let run = self.cached_run(&mut workflow_runs, &step.workflow_run_id).await?;
            if run.status.is_terminal() {
                let run_id = run.id;
                self.cancel_unstarted(run_id, &[step.id], "workflow run is already final").await?;
                report.cancelled += 1;
                continue;
            }
            let strategy = match sticky.get(&run.workflow_version_id) {
                Some(strategy) => *strategy,
                None => {
                    let strategy = self.sticky_strategy(run).await?;
                    sticky.insert(run.workflow_version_id, strategy);
                    strategy
                }
            };
            let result = self.assign_step(step, run, strategy).await;
            tally(&mut report, step.id, result);
        }

        if report != AssignmentReport::default() {
            tracing::debug!(
                assigned = report.assigned,
                no_worker = report.no_worker,
                rate_limited = report.rate_limited,
                conflicts = report.conflicts,
                cancelled = report.cancelled,
                "assignment pass"
            );
        }
        Ok(report)
    }

    /// Run assignment passes on the configured interval until `cancel` fires.
    pub async fn run_assigner(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config().scheduling.assign_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!("assignment loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_assignment_pass(Utc::now()).await {
                        tracing::warn!(error = %e, "assignment pass failed");
                    }
                }
            }
        }
        tracing::info!("assignment loop stopped");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn assign_step(
        &self,
        step: &StepRun,
        run: &mut WorkflowRun,
        sticky: Option<StickyStrategy>,
    ) -> Result<Assignment, EngineError> {
        if step.status != StepRunStatus::PendingAssignment {
            return Err(EngineError::Conflict(format!(
                "step run {} is not pending assignment",
                step.id
            )));
        }
        let placement = Placement {
            action: &step.action_id,
            units: step.slot_units.max(1),
            desired_labels: &step.desired_labels,
            sticky: sticky.zip(run.sticky_worker_id),
        };
        let pin_sticky = sticky.is_some() && run.sticky_worker_id.is_none();

        let result = self
            .place(
                UnitKind::StepRun,
                step.id,
                step.workflow_run_id,
                &placement,
                &step.rate_limits,
                pin_sticky,
            )
            .await;
        match &result {
            Ok(assignment) => {
                if pin_sticky {
                    run.sticky_worker_id = Some(assignment.worker_id);
                }
                self.emit(EngineEvent::StepRunStatusChanged {
                    step_run_id: step.id,
                    workflow_run_id: step.workflow_run_id,
                    status: StepRunStatus::Assigned,
                });
            }
            Err(e) if e.kind() == ErrorKind::ResourceExhausted => {
                self.defer_unit(UnitKind::StepRun, &step.id).await?
            }
            Err(_) => {}
        }
        result
    }

    async fn assign_group_key(&self, group_key_run: &GetGroupKeyRun) -> Result<Assignment, EngineError> {
        if group_key_run.status != StepRunStatus::PendingAssignment {
            return Err(EngineError::Conflict(format!(
                "group key run {} is not pending assignment",
                group_key_run.id
            )));
        }
        let no_labels = BTreeMap::new();
        let placement = Placement {
            action: &group_key_run.action_id,
            units: 1,
            desired_labels: &no_labels,
            sticky: None,
        };
        let result = self
            .place(
                UnitKind::GroupKeyRun,
                group_key_run.id,
                group_key_run.workflow_run_id,
                &placement,
                &BTreeMap::new(),
                false,
            )
            .await;
        if matches!(&result, Err(e) if e.kind() == ErrorKind::ResourceExhausted) {
            self.defer_unit(UnitKind::GroupKeyRun, &group_key_run.id).await?;
        }
        result
    }

    /// Walk the ranked candidates until one accepts the unit.
    async fn place(
        &self,
        kind: UnitKind,
        unit_id: Uuid,
        workflow_run_id: Uuid,
        placement: &Placement<'_>,
        rate_limits: &BTreeMap<String, i32>,
        pin_sticky: bool,
    ) -> Result<Assignment, EngineError> {
        let now = Utc::now();
        let heartbeat_after = now - self.config().scheduling.worker_heartbeat_window();
        let workers = self.store().workers();
        let candidates = self
            .persist(|| workers.list_candidates(placement.action, heartbeat_after))
            .await?;

        let runs = self.store().runs();
        for candidate in rank_workers(candidates, placement, heartbeat_after) {
            let request = SlotRequest {
                kind,
                unit_id,
                workflow_run_id,
                worker_id: candidate.worker.id,
                dispatcher_id: candidate.worker.dispatcher_id,
                units: placement.units,
                rate_limits: rate_limits.clone(),
                pin_sticky,
                at: now,
            };
            match self.persist(|| runs.assign_unit(&request)).await? {
                AssignOutcome::Assigned => {
                    tracing::debug!(
                        kind = ?kind,
                        %unit_id,
                        worker_id = %request.worker_id,
                        units = request.units,
                        "unit assigned"
                    );
                    self.emit(EngineEvent::UnitAssigned {
                        kind,
                        unit_id,
                        worker_id: request.worker_id,
                    });
                    return Ok(Assignment {
                        worker_id: request.worker_id,
                        dispatcher_id: request.dispatcher_id,
                    });
                }
                AssignOutcome::InsufficientSlots => continue,
                AssignOutcome::NotPendingAssignment => {
                    return Err(EngineError::Conflict(format!("{kind:?} {unit_id} was assigned concurrently")));
                }
                AssignOutcome::RateLimited { key } => {
                    tracing::debug!(%unit_id, %key, "rate limit exhausted");
                    return Err(EngineError::RateLimitExceeded { key });
                }
            }
        }

        tracing::debug!(%unit_id, action = placement.action, "no worker available");
        Err(EngineError::NoWorkerAvailable {
            action: placement.action.to_string(),
        })
    }

    /// Push a queued unit's next assignment attempt out by the requeue backoff.
    async fn defer_unit(&self, kind: UnitKind, id: &Uuid) -> Result<(), EngineError> {
        let retry_at = Utc::now() + self.config().scheduling.requeue_backoff();
        let update = UnitUpdate::to(StepRunStatus::PendingAssignment).requeue_after(retry_at);
        let from = [StepRunStatus::PendingAssignment];
        let runs = self.store().runs();
        match kind {
            UnitKind::StepRun => {
                self.persist(|| runs.transition_step_run(id, &from, &update)).await?;
            }
            UnitKind::GroupKeyRun => {
                self.persist(|| runs.transition_group_key_run(id, &from, &update)).await?;
            }
        }
        Ok(())
    }

    async fn sticky_strategy(&self, run: &WorkflowRun) -> Result<Option<StickyStrategy>, EngineError> {
        let workflows = self.store().workflows();
        let version = self
            .persist(|| workflows.get_version(&run.workflow_version_id))
            .await?
            .ok_or_else(|| EngineError::not_found("workflow version", &run.workflow_version_id))?;
        Ok(version.declaration.sticky)
    }

    async fn cached_run<'c>(
        &self,
        cache: &'c mut HashMap<Uuid, WorkflowRun>,
        id: &Uuid,
    ) -> Result<&'c mut WorkflowRun, EngineError> {
        if !cache.contains_key(id) {
            let run = self.get_workflow_run(id).await?;
            cache.insert(*id, run);
        }
        cache
            .get_mut(id)
            .ok_or_else(|| EngineError::not_found("workflow run", id))
    }
}

fn tally(report: &mut AssignmentReport, unit_id: Uuid, result: Result<Assignment, EngineError>) {
    match result {
        Ok(_) => report.assigned += 1,
        Err(EngineError::NoWorkerAvailable { .. }) => report.no_worker += 1,
        Err(EngineError::RateLimitExceeded { .. }) => report.rate_limited += 1,
        Err(e) if e.kind() == ErrorKind::Conflict => report.conflicts += 1,
        Err(e) => {
            tracing::warn!(%unit_id, error = %e, "assignment failed");
            report.errors += 1;
        }
    }
}
