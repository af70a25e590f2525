//! Timer firing.
//!
//! Cron and one-shot timers are rows owned by a ticker. Each pass claims
//! ownerless timers, then fires the due ones it owns. A cron occurrence is
//! won by compare-and-swap on `last_fired_at`, and a one-shot timer by
//! deleting it, so a timer handed between tickers mid-pass fires once.
//! Missed cron occurrences coalesce into a single run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use taskloom_types::ownership::{TimerSchedule, WorkflowTimer};
use taskloom_types::run::RunTrigger;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::repository::{OwnershipRepository, Store};
use crate::workflow::schedule::next_occurrence;
use crate::workflow::trigger::{TriggerRequest, WorkflowTarget};

const TIMER_TICK: Duration = Duration::from_secs(1);

/// Counts from one [`TimerScanner::fire_due`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimerReport {
    pub claimed: u64,
    pub fired: usize,
    pub failed: usize,
}

pub struct TimerScanner<S: Store> {
    engine: Engine<S>,
    ticker_id: Uuid,
}

impl<S: Store> TimerScanner<S> {
    pub fn new(engine: Engine<S>, ticker_id: Uuid) -> Self {
        Self { engine, ticker_id }
    }

    /// Claim ownerless timers and fire every owned timer due at `now`.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<TimerReport, EngineError> {
        let ownership = self.engine.store().ownership();
        let limit = self.engine.config().recovery.scan_batch_size;
        let mut report = TimerReport {
            claimed: self
                .engine
                .persist(|| ownership.claim_unowned_timers(&self.ticker_id, limit))
                .await?,
            ..Default::default()
        };

        let timers = self
            .engine
            .persist(|| ownership.list_timers_for_ticker(&self.ticker_id))
            .await?;
        for timer in &timers {
            let Some(trigger) = self.claim_occurrence(timer, now).await? else {
                continue;
            };
            let request = TriggerRequest {
                target: WorkflowTarget::Version(timer.workflow_version_id),
                trigger,
                input: timer.input.clone(),
                additional_metadata: Default::default(),
                priority: None,
                dedupe_value: None,
            };
            match self.engine.trigger_workflow(request).await {
                Ok(run) => {
                    tracing::info!(timer_id = %timer.id, workflow_run_id = %run.id, "timer fired");
                    report.fired += 1;
                }
                Err(e) => {
                    tracing::warn!(timer_id = %timer.id, error = %e, "timer trigger failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(TIMER_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(ticker_id = %self.ticker_id, "timer scanner started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.fire_due(Utc::now()).await {
                        tracing::warn!(error = %e, "timer pass failed");
                    }
                }
            }
        }
        tracing::info!(ticker_id = %self.ticker_id, "timer scanner stopped");
    }

    /// Win the timer's due occurrence, if any, and say how to trigger it.
    async fn claim_occurrence(&self, timer: &WorkflowTimer, now: DateTime<Utc>) -> Result<Option<RunTrigger>, EngineError> {
        let ownership = self.engine.store().ownership();
        match &timer.schedule {
            TimerSchedule::Cron { expression } => {
                let after = timer.last_fired_at.unwrap_or(timer.created_at);
                let due = match next_occurrence(expression, after) {
                    Ok(Some(at)) => at <= now,
                    Ok(None) => false,
                    Err(e) => {
                        tracing::warn!(timer_id = %timer.id, error = %e, "unparseable cron timer skipped");
                        false
                    }
                };
                if !due {
                    return Ok(None);
                }
                let won = self
                    .engine
                    .persist(|| ownership.record_cron_fire(&timer.id, timer.last_fired_at, now))
                    .await?;
                Ok(won.then(|| RunTrigger::Cron {
                    timer_id: timer.id,
                    expression: expression.clone(),
                }))
            }
            TimerSchedule::Once { trigger_at } => {
                if *trigger_at > now {
                    return Ok(None);
                }
                let won = self
                    .engine
                    .persist(|| ownership.consume_schedule_timer(&timer.id))
                    .await?;
                Ok(won.then_some(RunTrigger::Schedule { timer_id: timer.id }))
            }
        }
    }
}

impl<S: Store> Engine<S> {
    /// Schedule one run of the latest version of `workflow` at `trigger_at`.
    pub async fn schedule_workflow_run(
        &self,
        workflow: &str,
        trigger_at: DateTime<Utc>,
        input: Value,
    ) -> Result<WorkflowTimer, EngineError> {
        let version = self.latest_workflow_version(workflow).await?;
        let timer = WorkflowTimer {
            id: Uuid::now_v7(),
            workflow_id: version.workflow_id,
            workflow_version_id: version.id,
            schedule: TimerSchedule::Once { trigger_at },
            input,
            ticker_id: None,
            last_fired_at: None,
            created_at: Utc::now(),
        };
        let ownership = self.store().ownership();
        self.persist(|| ownership.create_timer(&timer)).await?;
        tracing::info!(timer_id = %timer.id, %workflow, %trigger_at, "workflow run scheduled");
        Ok(timer)
    }
}
