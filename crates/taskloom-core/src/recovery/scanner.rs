//! Recovery scanner.
//!
//! Finds units stuck past a deadline and drives them back into a state
//! where they make progress:
//!
//! - PENDING_ASSIGNMENT past the schedule timeout is requeued with a fresh
//!   timeout, or failed once the requeue budget is spent.
//! - ASSIGNED and never acknowledged within the ack timeout is unassigned.
//! - ASSIGNED or RUNNING on a worker whose heartbeat expired is released
//!   and requeued for another worker.
//! - RUNNING past its execution timeout is failed (and may retry).
//! - A stale dispatcher or ticker hands its holdings to a live peer chosen
//!   by a caller-supplied selection function.
//!
//! Every write is guarded, so two scanners racing over the same row make
//! one change between them.

use chrono::{DateTime, Utc};
use taskloom_types::event::AnalyticsKind;
use taskloom_types::ownership::{Coordinator, OwnerKind};
use taskloom_types::run::{StepRunStatus, UnitKind, UnitRef};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{EngineError, ErrorKind};
use crate::lifecycle::StepOutcome;
use crate::repository::run::UnitUpdate;
use crate::repository::{OwnershipRepository, RunRepository, Store};

/// Counts from one [`RecoveryScanner::scan_once`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub requeued: usize,
    /// Units failed because they exhausted their requeue budget.
    pub requeue_exhausted: usize,
    pub unacknowledged: usize,
    pub reassigned: usize,
    pub timed_out: usize,
    /// Units cancelled because their workflow run was already final.
    pub cancelled: usize,
    /// Rows moved from stale dispatchers and tickers to live peers.
    pub transferred: u64,
    pub expired: u64,
    pub conflicts: usize,
}

/// Hand a stale coordinator's holdings to the live peer that heartbeated
/// most recently.
pub fn select_freshest_peer(stale: &Coordinator, live: &[Coordinator]) -> Option<Uuid> {
    live.iter()
        .filter(|peer| peer.id != stale.id)
        .max_by_key(|peer| (peer.last_heartbeat_at, peer.id))
        .map(|peer| peer.id)
}

pub struct RecoveryScanner<S: Store> {
    engine: Engine<S>,
    ticker_id: Uuid,
}

impl<S: Store> RecoveryScanner<S> {
    pub fn new(engine: Engine<S>, ticker_id: Uuid) -> Self {
        Self { engine, ticker_id }
    }

    pub fn ticker_id(&self) -> Uuid {
        self.ticker_id
    }

    /// Run every responsibility once.
    pub async fn scan_once<F>(&self, now: DateTime<Utc>, select: &F) -> Result<ScanReport, EngineError>
    where
        F: Fn(&Coordinator, &[Coordinator]) -> Option<Uuid>,
    {
        let mut report = ScanReport::default();
        report.transferred += self.transfer_stale_owners(OwnerKind::Dispatcher, now, select).await?;
        report.transferred += self.transfer_stale_owners(OwnerKind::Ticker, now, select).await?;
        self.requeue_timed_out(now, &mut report).await?;
        self.unassign_unacknowledged(now, &mut report).await?;
        self.reassign_from_lost_workers(now, &mut report).await?;
        self.fail_execution_timeouts(now, &mut report).await?;
        report.expired = self.expire_retention(now).await?;

        if report != ScanReport::default() {
            tracing::info!(
                requeued = report.requeued,
                requeue_exhausted = report.requeue_exhausted,
                unacknowledged = report.unacknowledged,
                reassigned = report.reassigned,
                timed_out = report.timed_out,
                cancelled = report.cancelled,
                transferred = report.transferred,
                expired = report.expired,
                "recovery scan"
            );
        }
        Ok(report)
    }

    /// Heartbeat the ticker and scan on the configured interval until
    /// `cancel` fires.
    pub async fn run<F>(&self, cancel: CancellationToken, select: F)
    where
        F: Fn(&Coordinator, &[Coordinator]) -> Option<Uuid> + Send + Sync,
    {
        let mut ticker = tokio::time::interval(self.engine.config().recovery.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(ticker_id = %self.ticker_id, "recovery scanner started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.engine.heartbeat_coordinator(OwnerKind::Ticker, &self.ticker_id).await {
                        tracing::warn!(error = %e, "ticker heartbeat failed");
                    }
                    if let Err(e) = self.scan_once(Utc::now(), &select).await {
                        tracing::warn!(error = %e, "recovery scan failed");
                    }
                }
            }
        }
        tracing::info!(ticker_id = %self.ticker_id, "recovery scanner stopped");
    }

    // -----------------------------------------------------------------------
    // Responsibilities
    // -----------------------------------------------------------------------

    /// Requeue PENDING_ASSIGNMENT units past their schedule timeout.
    pub async fn requeue_timed_out(&self, now: DateTime<Utc>, report: &mut ScanReport) -> Result<(), EngineError> {
        let scheduling = &self.engine.config().scheduling;
        let limit = self.engine.config().recovery.scan_batch_size;
        let runs = self.engine.store().runs();
        let units = self
            .engine
            .persist(|| runs.list_units_past_schedule_timeout(now, limit))
            .await?;

        for unit in units {
            if self.cancel_if_run_final(&unit, report).await? {
                continue;
            }

            if unit.requeue_count >= scheduling.max_requeues {
                let reason = format!("not assigned after {} requeues", unit.requeue_count);
                let result = match unit.kind {
                    UnitKind::StepRun => self
                        .engine
                        .finish_step_run(&unit.id, StepOutcome::Failed(reason))
                        .await
                        .map(|_| ()),
                    UnitKind::GroupKeyRun => self.engine.fail_group_key_run(&unit.id, &reason).await.map(|_| ()),
                };
                if absorb(&unit, result, report)? {
                    tracing::warn!(unit_id = %unit.id, kind = ?unit.kind, "requeue budget exhausted");
                    report.requeue_exhausted += 1;
                }
                continue;
            }

            let update = UnitUpdate::to(StepRunStatus::PendingAssignment)
                .schedule_timeout_at(now + scheduling.schedule_timeout())
                .requeue_after(now)
                .incrementing_requeue();
            if self.move_unit(&unit, &[StepRunStatus::PendingAssignment], &update).await? {
                tracing::debug!(unit_id = %unit.id, requeue = unit.requeue_count + 1, "unit requeued");
                report.requeued += 1;
            } else {
                report.conflicts += 1;
            }
        }
        Ok(())
    }

    /// Unassign units whose worker never acknowledged the assignment.
    pub async fn unassign_unacknowledged(
        &self,
        now: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> Result<(), EngineError> {
        let deadline = now - self.engine.config().scheduling.ack_timeout();
        let limit = self.engine.config().recovery.scan_batch_size;
        let runs = self.engine.store().runs();
        let units = self
            .engine
            .persist(|| runs.list_units_past_ack_deadline(deadline, limit))
            .await?;

        for unit in units {
            let result = match unit.kind {
                UnitKind::StepRun => self.engine.unassign_step_run(&unit.id).await.map(|_| ()),
                UnitKind::GroupKeyRun => self.engine.unassign_group_key_run(&unit.id).await.map(|_| ()),
            };
            if absorb(&unit, result, report)? {
                tracing::debug!(unit_id = %unit.id, "assignment not acknowledged, unassigned");
                report.unacknowledged += 1;
            }
        }
        Ok(())
    }

    /// Release and requeue units held by workers that stopped heartbeating.
    pub async fn reassign_from_lost_workers(
        &self,
        now: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> Result<(), EngineError> {
        let scheduling = &self.engine.config().scheduling;
        let heartbeat_before = now - scheduling.worker_heartbeat_window();
        let limit = self.engine.config().recovery.scan_batch_size;
        let runs = self.engine.store().runs();
        let units = self
            .engine
            .persist(|| runs.list_units_on_lost_workers(heartbeat_before, limit))
            .await?;

        for unit in units {
            if self.cancel_if_run_final(&unit, report).await? {
                continue;
            }
            let update = UnitUpdate::to(StepRunStatus::PendingAssignment)
                .clearing_assignment()
                .schedule_timeout_at(now + scheduling.schedule_timeout())
                .requeue_after(now);
            if self.move_unit(&unit, &[unit.status], &update).await? {
                tracing::info!(
                    unit_id = %unit.id,
                    worker_id = ?unit.worker_id,
                    from = ?unit.status,
                    "unit reassigned from lost worker"
                );
                report.reassigned += 1;
            } else {
                report.conflicts += 1;
            }
        }
        Ok(())
    }

    /// Fail RUNNING step runs past their execution deadline.
    pub async fn fail_execution_timeouts(
        &self,
        now: DateTime<Utc>,
        report: &mut ScanReport,
    ) -> Result<(), EngineError> {
        let limit = self.engine.config().recovery.scan_batch_size;
        let runs = self.engine.store().runs();
        let units = self
            .engine
            .persist(|| runs.list_step_runs_past_execution_timeout(now, limit))
            .await?;

        for unit in units {
            let result = self.engine.fail_step_run(&unit.id, "step run timed out").await.map(|_| ());
            if absorb(&unit, result, report)? {
                report.timed_out += 1;
            }
        }
        Ok(())
    }

    /// Hand every stale coordinator's holdings to the peer `select` picks.
    /// Returns the number of rows moved.
    pub async fn transfer_stale_owners<F>(
        &self,
        kind: OwnerKind,
        now: DateTime<Utc>,
        select: &F,
    ) -> Result<u64, EngineError>
    where
        F: Fn(&Coordinator, &[Coordinator]) -> Option<Uuid>,
    {
        let heartbeat_after = now - self.engine.config().recovery.coordinator_stale_after();
        let ownership = self.engine.store().ownership();
        let coordinators = self.engine.persist(|| ownership.list_coordinators(kind)).await?;
        let (stale, live): (Vec<Coordinator>, Vec<Coordinator>) =
            coordinators.into_iter().partition(|c| c.is_stale(heartbeat_after));

        let mut moved = 0;
        for owner in &stale {
            let Some(peer) = select(owner, &live) else {
                tracing::warn!(owner_id = %owner.id, kind = ?kind, "stale coordinator has no live peer");
                continue;
            };
            let rows = self
                .engine
                .persist(|| ownership.transfer_ownership(kind, &owner.id, &peer))
                .await?;
            tracing::info!(from = %owner.id, to = %peer, kind = ?kind, rows, "ownership transferred");
            moved += rows;
        }
        Ok(moved)
    }

    /// Soft-expire final workflow runs older than the retention window.
    pub async fn expire_retention(&self, now: DateTime<Utc>) -> Result<u64, EngineError> {
        let cutoff = now - self.engine.config().recovery.retention();
        let runs = self.engine.store().runs();
        let expired = self
            .engine
            .persist(|| runs.soft_expire_workflow_runs(cutoff, now))
            .await?;
        if expired > 0 {
            tracing::debug!(expired, "workflow runs expired");
        }
        Ok(expired)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Units of a final workflow run never need a worker again. Cancels the
    /// unit from the status it was found in, releasing any slot it holds, and
    /// returns whether the run was final.
    async fn cancel_if_run_final(&self, unit: &UnitRef, report: &mut ScanReport) -> Result<bool, EngineError> {
        let run = self.engine.get_workflow_run(&unit.workflow_run_id).await?;
        if !run.status.is_terminal() {
            return Ok(false);
        }
        let now = Utc::now();
        let reason = "workflow run is already final";
        let update = UnitUpdate::to(StepRunStatus::Cancelled)
            .error(reason)
            .finished_at(now);
        if self.move_unit(unit, &[unit.status], &update).await? {
            let kind = match unit.kind {
                UnitKind::StepRun => AnalyticsKind::StepRunFinished,
                UnitKind::GroupKeyRun => AnalyticsKind::GroupKeyRunFinished,
            };
            self.engine.record(
                kind,
                unit.id,
                unit.workflow_run_id,
                StepRunStatus::Cancelled,
                Some(reason.to_string()),
                now,
            );
            tracing::debug!(unit_id = %unit.id, from = ?unit.status, "unit of a final run cancelled");
            report.cancelled += 1;
        } else {
            report.conflicts += 1;
        }
        Ok(true)
    }

    async fn move_unit(&self, unit: &UnitRef, from: &[StepRunStatus], update: &UnitUpdate) -> Result<bool, EngineError> {
        let runs = self.engine.store().runs();
        match unit.kind {
            UnitKind::StepRun => {
                let moved = self
                    .engine
                    .persist(|| runs.transition_step_run(&unit.id, from, update))
                    .await?;
                if let Some(step) = &moved {
                    self.engine.emit_step(step);
                }
                Ok(moved.is_some())
            }
            UnitKind::GroupKeyRun => Ok(self
                .engine
                .persist(|| runs.transition_group_key_run(&unit.id, from, update))
                .await?
                .is_some()),
        }
    }
}

/// Count a per-unit conflict instead of aborting the scan. Returns whether
/// the operation took effect.
fn absorb(unit: &UnitRef, result: Result<(), EngineError>, report: &mut ScanReport) -> Result<bool, EngineError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::Conflict => {
            tracing::debug!(unit_id = %unit.id, error = %e, "unit changed during scan");
            report.conflicts += 1;
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(age_secs: i64) -> Coordinator {
        Coordinator::new(OwnerKind::Dispatcher, Utc::now() - chrono::Duration::seconds(age_secs))
    }

    #[test]
    fn test_freshest_peer_wins() {
        let stale = coordinator(300);
        let older = coordinator(20);
        let fresher = coordinator(2);
        let picked = select_freshest_peer(&stale, &[older, fresher.clone()]);
        assert_eq!(picked, Some(fresher.id));
    }

    #[test]
    fn test_never_hands_back_to_itself() {
        let stale = coordinator(300);
        assert_eq!(select_freshest_peer(&stale, &[stale.clone()]), None);
        assert_eq!(select_freshest_peer(&stale, &[]), None);
    }

    #[test]
    fn test_absorb_counts_conflicts_only() {
        let unit = UnitRef {
            kind: UnitKind::StepRun,
            id: Uuid::now_v7(),
            workflow_run_id: Uuid::now_v7(),
            status: StepRunStatus::Assigned,
            requeue_count: 0,
            worker_id: None,
        };
        let mut report = ScanReport::default();
        assert!(!absorb(&unit, Err(EngineError::StepRunIsNotAssigned(unit.id)), &mut report).unwrap());
        assert_eq!(report.conflicts, 1);
        assert!(absorb(&unit, Ok(()), &mut report).unwrap());
        assert!(absorb(&unit, Err(EngineError::NotFound("x".to_string())), &mut report).is_err());
    }
}
