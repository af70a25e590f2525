//! End-to-end engine scenarios against a real SQLite store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use taskloom_core::lifecycle::StepTransition;
use taskloom_core::recovery::{RecoveryScanner, ScanReport, TimerScanner, select_freshest_peer};
use taskloom_core::repository::{OwnershipRepository, RunRepository, Store};
use taskloom_core::repository::run::WorkflowRunFilter;
use taskloom_core::scheduling::{AdmissionOutcome, WorkerRegistration};
use taskloom_core::workflow::TriggerRequest;
use taskloom_core::workflow::registry::parse_declaration;
use taskloom_core::{Engine, EngineError, ErrorKind};
use taskloom_types::config::EngineConfig;
use taskloom_types::event::EngineEvent;
use taskloom_types::ownership::{Coordinator, OwnerKind};
use taskloom_types::run::{RunTrigger, StepRun, StepRunStatus, WorkflowRun, WorkflowRunStatus};
use taskloom_types::worker::Worker;
use taskloom_types::workflow::WorkflowVersion;
use uuid::Uuid;

use crate::crypto::hash::Sha256ContentHasher;
use crate::sqlite::SqliteStore;
use crate::sqlite::run::{CANCELLED_BY_NEWER_RUN, DROPPED_AT_LIMIT};
use crate::sqlite::test_support::test_pool;

async fn engine_with(config: EngineConfig) -> Engine<SqliteStore> {
    let store = SqliteStore::new(test_pool().await);
    Engine::new(store, config, Arc::new(Sha256ContentHasher::new()))
}

async fn engine() -> Engine<SqliteStore> {
    engine_with(EngineConfig::default()).await
}

async fn register(engine: &Engine<SqliteStore>, yaml: &str) -> WorkflowVersion {
    let declaration = parse_declaration(yaml).unwrap();
    engine.register_workflow(declaration).await.unwrap().version
}

/// Two independent steps, limited per `input.tenant`.
fn limited_workflow(name: &str, strategy: &str, max_runs: u32) -> String {
    format!(
        r#"
name: {name}
concurrency:
  expression: input.tenant
  max_runs: {max_runs}
  limit_strategy: {strategy}
jobs:
  - name: main
    steps:
      - readable_id: extract
        action: demo:step
      - readable_id: load
        action: demo:step
"#
    )
}

const CHAIN: &str = r#"
name: chain
jobs:
  - name: main
    steps:
      - readable_id: fetch
        action: demo:step
      - readable_id: publish
        action: demo:step
        parents: [fetch]
"#;

const SINGLE: &str = r#"
name: single
jobs:
  - name: main
    steps:
      - readable_id: only
        action: demo:step
"#;

async fn worker(engine: &Engine<SqliteStore>, max_runs: u32) -> Worker {
    engine
        .register_worker(WorkerRegistration::new("scenario", max_runs, vec!["demo:step".to_string()]))
        .await
        .unwrap()
}

async fn trigger(engine: &Engine<SqliteStore>, workflow: &str, tenant: &str) -> WorkflowRun {
    engine
        .trigger_workflow(TriggerRequest::manual(workflow, json!({ "tenant": tenant })))
        .await
        .unwrap()
}

async fn steps_of(engine: &Engine<SqliteStore>, run_id: &Uuid) -> Vec<StepRun> {
    engine
        .store()
        .runs()
        .list_step_runs_for_workflow_run(run_id)
        .await
        .unwrap()
}

async fn status_of(engine: &Engine<SqliteStore>, run_id: &Uuid) -> WorkflowRunStatus {
    engine.get_workflow_run(run_id).await.unwrap().status
}

/// Past the requeue backoff, so deferred steps are due again.
fn assign_at() -> DateTime<Utc> {
    Utc::now() + Duration::seconds(10)
}

/// Assign, start and complete the steps of one run until it is final.
async fn drive_to_completion(engine: &Engine<SqliteStore>, worker: &Worker, run_id: &Uuid) -> WorkflowRun {
    for _ in 0..10 {
        engine.run_assignment_pass(assign_at()).await.unwrap();
        for step in steps_of(engine, run_id).await {
            if step.status == StepRunStatus::Assigned && step.worker_id == Some(worker.id) {
                engine.start_step_run(&step.id, &worker.id).await.unwrap();
                engine.complete_step_run(&step.id, json!({ "done": step.step_name })).await.unwrap();
            }
        }
        let run = engine.get_workflow_run(run_id).await.unwrap();
        if run.status.is_terminal() {
            return run;
        }
    }
    panic!("workflow run {run_id} did not finish");
}

/// The one step of `run_id` named `name`.
async fn step_named(engine: &Engine<SqliteStore>, run_id: &Uuid, name: &str) -> StepRun {
    steps_of(engine, run_id)
        .await
        .into_iter()
        .find(|s| s.step_name == name)
        .unwrap()
}

// ---------------------------------------------------------------------------
// Concurrency admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_queue_newest_admits_queued_runs_in_arrival_order() {
    let engine = engine().await;
    register(&engine, &limited_workflow("ingest", "queue_newest", 1)).await;
    let worker = worker(&engine, 10).await;

    let first = trigger(&engine, "ingest", "acme").await;
    let second = trigger(&engine, "ingest", "acme").await;
    let third = trigger(&engine, "ingest", "acme").await;
    let other_tenant = trigger(&engine, "ingest", "globex").await;

    assert_eq!(first.status, WorkflowRunStatus::Running);
    assert_eq!(second.status, WorkflowRunStatus::Queued);
    assert_eq!(third.status, WorkflowRunStatus::Queued);
    assert_eq!(other_tenant.status, WorkflowRunStatus::Running);
    assert!(
        steps_of(&engine, &second.id)
            .await
            .iter()
            .all(|s| s.status == StepRunStatus::Pending)
    );

    let finished = drive_to_completion(&engine, &worker, &first.id).await;
    assert_eq!(finished.status, WorkflowRunStatus::Succeeded);
    assert_eq!(status_of(&engine, &second.id).await, WorkflowRunStatus::Running);
    assert_eq!(status_of(&engine, &third.id).await, WorkflowRunStatus::Queued);
    assert!(
        steps_of(&engine, &second.id)
            .await
            .iter()
            .all(|s| s.status == StepRunStatus::PendingAssignment)
    );

    drive_to_completion(&engine, &worker, &second.id).await;
    assert_eq!(status_of(&engine, &third.id).await, WorkflowRunStatus::Running);
}

#[tokio::test]
async fn test_cancel_in_progress_replaces_the_running_run() {
    let engine = engine().await;
    register(&engine, &limited_workflow("deploy", "cancel_in_progress", 1)).await;

    let first = trigger(&engine, "deploy", "prod").await;
    let second_request = TriggerRequest::manual("deploy", json!({ "tenant": "prod" }));
    let second = engine.trigger_workflow(second_request).await.unwrap();

    let first = engine.get_workflow_run(&first.id).await.unwrap();
    assert_eq!(first.status, WorkflowRunStatus::Cancelled);
    assert_eq!(first.error.as_deref(), Some(CANCELLED_BY_NEWER_RUN));
    assert!(
        steps_of(&engine, &first.id)
            .await
            .iter()
            .all(|s| s.status == StepRunStatus::Cancelled)
    );
    assert_eq!(second.status, WorkflowRunStatus::Running);
}

#[tokio::test]
async fn test_drop_newest_rejects_the_newcomer() {
    let engine = engine().await;
    register(&engine, &limited_workflow("sync", "drop_newest", 1)).await;

    let first = trigger(&engine, "sync", "acme").await;
    let second = trigger(&engine, "sync", "acme").await;

    assert_eq!(second.status, WorkflowRunStatus::Cancelled);
    assert_eq!(second.error.as_deref(), Some(DROPPED_AT_LIMIT));
    assert!(steps_of(&engine, &second.id).await.iter().all(|s| s.status.is_terminal()));
    assert_eq!(status_of(&engine, &first.id).await, WorkflowRunStatus::Running);

    // Re-admitting a decided run reports what was decided.
    let outcome = engine.admit_workflow_run(&second.id).await.unwrap();
    assert!(matches!(outcome, AdmissionOutcome::AlreadyDecided(WorkflowRunStatus::Cancelled)));
}

#[tokio::test]
async fn test_group_round_robin_shares_capacity_across_keys() {
    let engine = engine().await;
    register(&engine, &limited_workflow("report", "group_round_robin", 2)).await;

    let a1 = trigger(&engine, "report", "a").await;
    let a2 = trigger(&engine, "report", "a").await;
    let a3 = trigger(&engine, "report", "a").await;
    let a4 = trigger(&engine, "report", "a").await;
    let b1 = trigger(&engine, "report", "b").await;
    assert_eq!(a1.status, WorkflowRunStatus::Running);
    assert_eq!(a2.status, WorkflowRunStatus::Running);
    assert_eq!(a3.status, WorkflowRunStatus::Queued);
    assert_eq!(b1.status, WorkflowRunStatus::Queued);

    // "a" still holds a slot, so the freed one goes to "b" despite the burst.
    engine.cancel_workflow_run(&a1.id, "operator").await.unwrap();
    assert_eq!(status_of(&engine, &b1.id).await, WorkflowRunStatus::Running);
    assert_eq!(status_of(&engine, &a3.id).await, WorkflowRunStatus::Queued);

    engine.cancel_workflow_run(&a2.id, "operator").await.unwrap();
    assert_eq!(status_of(&engine, &a3.id).await, WorkflowRunStatus::Running);
    assert_eq!(status_of(&engine, &a4.id).await, WorkflowRunStatus::Queued);
}

#[tokio::test]
async fn test_group_key_run_gates_admission() {
    let engine = engine().await;
    register(
        &engine,
        r#"
name: keyed
concurrency:
  action: demo:key
  max_runs: 1
  limit_strategy: queue_newest
jobs:
  - name: main
    steps:
      - readable_id: only
        action: demo:step
"#,
    )
    .await;
    let keyer = engine
        .register_worker(WorkerRegistration::new("keyer", 5, vec!["demo:key".to_string()]))
        .await
        .unwrap();

    let run = trigger(&engine, "keyed", "acme").await;
    assert_eq!(run.status, WorkflowRunStatus::Pending);
    let group_key_run = engine
        .store()
        .runs()
        .get_group_key_run_for_workflow_run(&run.id)
        .await
        .unwrap()
        .unwrap();

    let assignment = engine.assign_group_key_run(&group_key_run.id).await.unwrap();
    assert_eq!(assignment.worker_id, keyer.id);
    assert_eq!(engine.get_worker(&keyer.id).await.unwrap().used_slots, 1);
    engine.start_group_key_run(&group_key_run.id, &keyer.id).await.unwrap();
    engine.complete_group_key_run(&group_key_run.id, "acme").await.unwrap();

    let run = engine.get_workflow_run(&run.id).await.unwrap();
    assert_eq!(run.status, WorkflowRunStatus::Running);
    assert_eq!(run.concurrency_group_key.as_deref(), Some("acme"));
    assert_eq!(engine.get_worker(&keyer.id).await.unwrap().used_slots, 0);
}

#[tokio::test]
async fn test_unplaceable_group_key_run_waits_out_the_backoff() {
    let engine = engine().await;
    register(
        &engine,
        r#"
name: keyed
concurrency:
  action: demo:key
  max_runs: 1
jobs:
  - name: main
    steps:
      - readable_id: only
        action: demo:step
"#,
    )
    .await;
    trigger(&engine, "keyed", "acme").await;

    let report = engine.run_assignment_pass(Utc::now()).await.unwrap();
    assert_eq!(report.no_worker, 1);

    // Deferred: not due again until the backoff has passed.
    let report = engine.run_assignment_pass(Utc::now()).await.unwrap();
    assert_eq!(report.no_worker, 0);

    let after_backoff = Utc::now() + engine.config().scheduling.requeue_backoff() + Duration::seconds(1);
    let report = engine.run_assignment_pass(after_backoff).await.unwrap();
    assert_eq!(report.no_worker, 1);
}

// ---------------------------------------------------------------------------
// Lifecycle and slots
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_slot_is_held_exactly_while_assigned_or_running() {
    let engine = engine().await;
    register(&engine, &limited_workflow("slots", "queue_newest", 5)).await;
    let worker = worker(&engine, 1).await;
    let run = trigger(&engine, "slots", "acme").await;

    let report = engine.run_assignment_pass(assign_at()).await.unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(report.no_worker, 1);

    let held = |steps: &[StepRun]| steps.iter().filter(|s| s.status.holds_slot()).count() as u32;
    let steps = steps_of(&engine, &run.id).await;
    assert_eq!(held(&steps), 1);
    assert_eq!(engine.get_worker(&worker.id).await.unwrap().used_slots, 1);

    let assigned = steps.iter().find(|s| s.status == StepRunStatus::Assigned).unwrap();
    engine.start_step_run(&assigned.id, &worker.id).await.unwrap();
    assert_eq!(engine.get_worker(&worker.id).await.unwrap().used_slots, 1);

    engine.complete_step_run(&assigned.id, json!({})).await.unwrap();
    let steps = steps_of(&engine, &run.id).await;
    assert_eq!(held(&steps), 0);
    assert_eq!(engine.get_worker(&worker.id).await.unwrap().used_slots, 0);

    // Releasing twice never frees capacity twice.
    assert!(!engine.release_step_run_slot(&assigned.id).await.unwrap());
    assert_eq!(engine.get_worker(&worker.id).await.unwrap().used_slots, 0);
}

#[tokio::test]
async fn test_competing_assignments_have_one_winner() {
    let engine = engine().await;
    register(&engine, SINGLE).await;
    let first = worker(&engine, 1).await;
    let second = worker(&engine, 1).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("single", json!({})))
        .await
        .unwrap();
    let step = step_named(&engine, &run.id, "only").await;
    assert_eq!(step.status, StepRunStatus::PendingAssignment);

    let won = engine.assign_step_run(&step.id).await.unwrap();
    let lost = engine.assign_step_run(&step.id).await.unwrap_err();
    assert_eq!(lost.kind(), ErrorKind::Conflict);

    let assigned = step_named(&engine, &run.id, "only").await;
    assert_eq!(assigned.status, StepRunStatus::Assigned);
    assert_eq!(assigned.worker_id, Some(won.worker_id));
    let used = engine.get_worker(&first.id).await.unwrap().used_slots
        + engine.get_worker(&second.id).await.unwrap().used_slots;
    assert_eq!(used, 1);
}

#[tokio::test]
async fn test_queue_step_run_on_non_pending_step_changes_nothing() {
    let engine = engine().await;
    register(&engine, CHAIN).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("chain", json!({})))
        .await
        .unwrap();
    let fetch = step_named(&engine, &run.id, "fetch").await;
    assert_eq!(fetch.status, StepRunStatus::PendingAssignment);

    let err = engine.queue_step_run(&fetch.id).await.unwrap_err();
    assert!(matches!(err, EngineError::StepRunIsNotPending(id) if id == fetch.id));

    let after = engine.get_step_run(&fetch.id).await.unwrap();
    assert_eq!(after.status, fetch.status);
    assert_eq!(after.schedule_timeout_at, fetch.schedule_timeout_at);
    assert_eq!(after.requeue_after, fetch.requeue_after);
}

#[tokio::test]
async fn test_terminal_writes_are_idempotent_and_exclusive() {
    let engine = engine().await;
    register(&engine, SINGLE).await;
    let worker = worker(&engine, 1).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("single", json!({})))
        .await
        .unwrap();
    let finished = drive_to_completion(&engine, &worker, &run.id).await;
    assert_eq!(finished.status, WorkflowRunStatus::Succeeded);

    let only = step_named(&engine, &run.id, "only").await;
    let again = engine.complete_step_run(&only.id, json!({ "other": true })).await.unwrap();
    assert!(matches!(again, StepTransition::NoOp(_)));
    assert_eq!(again.step_run().output, only.output);

    let err = engine.fail_step_run(&only.id, "late failure").await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyFinal { .. }));
    let after = engine.get_step_run(&only.id).await.unwrap();
    assert_eq!(after.status, StepRunStatus::Succeeded);
    assert_eq!(after.error, None);
}

#[tokio::test]
async fn test_failed_step_retries_before_failing_the_run() {
    let engine = engine().await;
    register(
        &engine,
        r#"
name: flaky
jobs:
  - name: main
    steps:
      - readable_id: call
        action: demo:step
        retries: 1
"#,
    )
    .await;
    let worker = worker(&engine, 1).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("flaky", json!({})))
        .await
        .unwrap();

    for expected_retry in [true, false] {
        engine.run_assignment_pass(assign_at()).await.unwrap();
        let call = step_named(&engine, &run.id, "call").await;
        engine.start_step_run(&call.id, &worker.id).await.unwrap();
        let transition = engine.fail_step_run(&call.id, "upstream 503").await.unwrap();
        assert_eq!(matches!(transition, StepTransition::Retrying(_)), expected_retry);
    }

    let run = engine.get_workflow_run(&run.id).await.unwrap();
    assert_eq!(run.status, WorkflowRunStatus::Failed);
    assert_eq!(step_named(&engine, &run.id, "call").await.retry_count, 1);
}

#[tokio::test]
async fn test_cancelled_run_is_observed_by_running_steps() {
    let engine = engine().await;
    register(&engine, CHAIN).await;
    let worker = worker(&engine, 1).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("chain", json!({})))
        .await
        .unwrap();
    engine.run_assignment_pass(assign_at()).await.unwrap();
    let fetch = step_named(&engine, &run.id, "fetch").await;
    engine.start_step_run(&fetch.id, &worker.id).await.unwrap();
    let mut watch = engine.events().subscribe_run(run.id);

    engine.cancel_workflow_run(&run.id, "operator").await.unwrap();
    assert!(engine.step_run_should_cancel(&fetch.id).await.unwrap());
    let cancelled = loop {
        match watch.next().await.unwrap() {
            EngineEvent::WorkflowRunStatusChanged { status, .. } => break status,
            _ => continue,
        }
    };
    assert_eq!(cancelled, WorkflowRunStatus::Cancelled);
    assert_eq!(step_named(&engine, &run.id, "publish").await.status, StepRunStatus::Cancelled);

    engine.cancel_step_run(&fetch.id, "observed cancellation").await.unwrap();
    assert_eq!(engine.get_worker(&worker.id).await.unwrap().used_slots, 0);
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_requeue_advances_the_schedule_timeout() {
    let mut config = EngineConfig::default();
    config.scheduling.max_requeues = 1;
    let engine = engine_with(config).await;
    register(&engine, SINGLE).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("single", json!({})))
        .await
        .unwrap();
    let before = step_named(&engine, &run.id, "only").await;
    let deadline = before.schedule_timeout_at.unwrap();

    let scanner = RecoveryScanner::new(engine.clone(), Uuid::now_v7());
    let later = deadline + Duration::seconds(1);
    let mut report = ScanReport::default();
    scanner.requeue_timed_out(later, &mut report).await.unwrap();
    assert_eq!(report.requeued, 1);

    let requeued = engine.get_step_run(&before.id).await.unwrap();
    assert_eq!(requeued.status, StepRunStatus::PendingAssignment);
    assert_eq!(requeued.requeue_count, 1);
    assert!(requeued.schedule_timeout_at.unwrap() > deadline);

    // The budget is spent on the next timeout.
    let much_later = requeued.schedule_timeout_at.unwrap() + Duration::seconds(1);
    let mut report = ScanReport::default();
    scanner.requeue_timed_out(much_later, &mut report).await.unwrap();
    assert_eq!(report.requeue_exhausted, 1);
    assert_eq!(engine.get_step_run(&before.id).await.unwrap().status, StepRunStatus::Failed);
    assert_eq!(status_of(&engine, &run.id).await, WorkflowRunStatus::Failed);
}

#[tokio::test]
async fn test_unacknowledged_assignment_is_returned_to_the_queue() {
    let engine = engine().await;
    register(&engine, SINGLE).await;
    let worker = worker(&engine, 1).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("single", json!({})))
        .await
        .unwrap();
    engine.run_assignment_pass(assign_at()).await.unwrap();
    let only = step_named(&engine, &run.id, "only").await;
    assert_eq!(only.status, StepRunStatus::Assigned);

    let scanner = RecoveryScanner::new(engine.clone(), Uuid::now_v7());
    let mut report = ScanReport::default();
    let past_ack = Utc::now() + engine.config().scheduling.ack_timeout() + Duration::seconds(1);
    scanner.unassign_unacknowledged(past_ack, &mut report).await.unwrap();
    assert_eq!(report.unacknowledged, 1);

    let only = engine.get_step_run(&only.id).await.unwrap();
    assert_eq!(only.status, StepRunStatus::PendingAssignment);
    assert_eq!(only.worker_id, None);
    assert_eq!(engine.get_worker(&worker.id).await.unwrap().used_slots, 0);

    let err = engine.start_step_run(&only.id, &worker.id).await.unwrap_err();
    assert!(matches!(err, EngineError::StepRunIsNotAssigned(_)));
}

#[tokio::test]
async fn test_steps_on_lost_workers_move_to_a_live_one() {
    let engine = engine().await;
    register(&engine, SINGLE).await;
    let lost = worker(&engine, 1).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("single", json!({})))
        .await
        .unwrap();
    engine.run_assignment_pass(assign_at()).await.unwrap();
    let only = step_named(&engine, &run.id, "only").await;
    engine.start_step_run(&only.id, &lost.id).await.unwrap();
    engine.deactivate_worker(&lost.id).await.unwrap();

    let scanner = RecoveryScanner::new(engine.clone(), Uuid::now_v7());
    let mut report = ScanReport::default();
    let now = Utc::now();
    scanner.reassign_from_lost_workers(now, &mut report).await.unwrap();
    assert_eq!(report.reassigned, 1);
    assert_eq!(engine.get_step_run(&only.id).await.unwrap().status, StepRunStatus::PendingAssignment);
    assert_eq!(engine.get_worker(&lost.id).await.unwrap().used_slots, 0);

    let live = worker(&engine, 1).await;
    engine.run_assignment_pass(now + Duration::seconds(1)).await.unwrap();
    let only = engine.get_step_run(&only.id).await.unwrap();
    assert_eq!(only.status, StepRunStatus::Assigned);
    assert_eq!(only.worker_id, Some(live.id));
}

#[tokio::test]
async fn test_running_step_of_a_cancelled_run_is_freed_from_a_lost_worker() {
    let engine = engine().await;
    register(&engine, SINGLE).await;
    let lost = worker(&engine, 1).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("single", json!({})))
        .await
        .unwrap();
    engine.run_assignment_pass(assign_at()).await.unwrap();
    let only = step_named(&engine, &run.id, "only").await;
    engine.start_step_run(&only.id, &lost.id).await.unwrap();
    engine.cancel_workflow_run(&run.id, "operator").await.unwrap();
    engine.deactivate_worker(&lost.id).await.unwrap();

    let scanner = RecoveryScanner::new(engine.clone(), Uuid::now_v7());
    let mut report = ScanReport::default();
    scanner.reassign_from_lost_workers(Utc::now(), &mut report).await.unwrap();
    assert_eq!(report.cancelled, 1);
    assert_eq!(report.reassigned, 0);

    let only = engine.get_step_run(&only.id).await.unwrap();
    assert_eq!(only.status, StepRunStatus::Cancelled);
    assert_eq!(engine.get_worker(&lost.id).await.unwrap().used_slots, 0);

    let mut report = ScanReport::default();
    scanner.reassign_from_lost_workers(Utc::now(), &mut report).await.unwrap();
    assert_eq!(report, ScanReport::default());
}

#[tokio::test]
async fn test_running_group_key_run_of_a_cancelled_run_is_freed_from_a_lost_worker() {
    let engine = engine().await;
    register(
        &engine,
        r#"
name: keyed
concurrency:
  action: demo:key
  max_runs: 1
  limit_strategy: queue_newest
jobs:
  - name: main
    steps:
      - readable_id: only
        action: demo:step
"#,
    )
    .await;
    let keyer = engine
        .register_worker(WorkerRegistration::new("keyer", 1, vec!["demo:key".to_string()]))
        .await
        .unwrap();
    let run = trigger(&engine, "keyed", "acme").await;
    let group_key_run = engine
        .store()
        .runs()
        .get_group_key_run_for_workflow_run(&run.id)
        .await
        .unwrap()
        .unwrap();
    engine.assign_group_key_run(&group_key_run.id).await.unwrap();
    engine.start_group_key_run(&group_key_run.id, &keyer.id).await.unwrap();
    engine.cancel_workflow_run(&run.id, "operator").await.unwrap();
    engine.deactivate_worker(&keyer.id).await.unwrap();

    let scanner = RecoveryScanner::new(engine.clone(), Uuid::now_v7());
    let mut report = ScanReport::default();
    scanner.reassign_from_lost_workers(Utc::now(), &mut report).await.unwrap();
    assert_eq!(report.cancelled, 1);

    let group_key_run = engine
        .store()
        .runs()
        .get_group_key_run(&group_key_run.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(group_key_run.status, StepRunStatus::Cancelled);
    assert_eq!(engine.get_worker(&keyer.id).await.unwrap().used_slots, 0);
}

#[tokio::test]
async fn test_stale_coordinators_hand_their_holdings_to_live_peers() {
    let engine = engine().await;
    register(&engine, SINGLE).await;
    let ownership = engine.store().ownership();
    let long_ago = Utc::now() - engine.config().recovery.coordinator_stale_after() - Duration::minutes(5);
    let stale_ticker = Coordinator::new(OwnerKind::Ticker, long_ago);
    let stale_dispatcher = Coordinator::new(OwnerKind::Dispatcher, long_ago);
    ownership.upsert_coordinator(&stale_ticker).await.unwrap();
    ownership.upsert_coordinator(&stale_dispatcher).await.unwrap();
    let live_ticker = engine.register_coordinator(OwnerKind::Ticker).await.unwrap();
    let live_dispatcher = engine.register_coordinator(OwnerKind::Dispatcher).await.unwrap();

    engine
        .schedule_workflow_run("single", Utc::now() + Duration::hours(1), json!({}))
        .await
        .unwrap();
    let claimed = TimerScanner::new(engine.clone(), stale_ticker.id)
        .fire_due(Utc::now())
        .await
        .unwrap();
    assert_eq!(claimed.claimed, 1);
    let connected = engine
        .register_worker(
            WorkerRegistration::new("connected", 1, vec!["demo:step".to_string()])
                .via_dispatcher(stale_dispatcher.id),
        )
        .await
        .unwrap();

    let scanner = RecoveryScanner::new(engine.clone(), live_ticker.id);
    let report = scanner.scan_once(Utc::now(), &select_freshest_peer).await.unwrap();
    assert_eq!(report.transferred, 2);

    assert_eq!(ownership.list_timers_for_ticker(&live_ticker.id).await.unwrap().len(), 1);
    assert!(ownership.list_timers_for_ticker(&stale_ticker.id).await.unwrap().is_empty());
    let worker = engine.get_worker(&connected.id).await.unwrap();
    assert_eq!(worker.worker.dispatcher_id, Some(live_dispatcher.id));

    // The stale owners are retired, so a second scan moves nothing.
    let report = scanner.scan_once(Utc::now(), &select_freshest_peer).await.unwrap();
    assert_eq!(report.transferred, 0);
}

#[tokio::test]
async fn test_finished_runs_expire_after_retention() {
    let engine = engine().await;
    register(&engine, SINGLE).await;
    let worker = worker(&engine, 1).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("single", json!({})))
        .await
        .unwrap();
    drive_to_completion(&engine, &worker, &run.id).await;

    let scanner = RecoveryScanner::new(engine.clone(), Uuid::now_v7());
    assert_eq!(scanner.expire_retention(Utc::now()).await.unwrap(), 0);
    let after_retention = Utc::now() + engine.config().recovery.retention() + Duration::days(1);
    assert_eq!(scanner.expire_retention(after_retention).await.unwrap(), 1);

    let visible = engine.list_workflow_runs(&WorkflowRunFilter::default()).await.unwrap();
    assert!(visible.iter().all(|r| r.id != run.id));
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_replay_waits_for_downstream_steps() {
    let engine = engine().await;
    register(&engine, CHAIN).await;
    let worker = worker(&engine, 2).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("chain", json!({ "page": 1 })))
        .await
        .unwrap();

    engine.run_assignment_pass(assign_at()).await.unwrap();
    let fetch = step_named(&engine, &run.id, "fetch").await;
    engine.start_step_run(&fetch.id, &worker.id).await.unwrap();
    engine.complete_step_run(&fetch.id, json!({ "rows": 3 })).await.unwrap();
    let publish = step_named(&engine, &run.id, "publish").await;
    assert_eq!(publish.status, StepRunStatus::PendingAssignment);

    let err = engine.replay_step_run(&fetch.id, None).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::PreflightReplayChildStepRunNotInFinalState { parent, child }
            if parent == fetch.id && child == publish.id
    ));
    assert_eq!(engine.get_step_run(&fetch.id).await.unwrap().status, StepRunStatus::Succeeded);

    let finished = drive_to_completion(&engine, &worker, &run.id).await;
    assert_eq!(finished.status, WorkflowRunStatus::Succeeded);

    let replayed = engine
        .replay_step_run(&fetch.id, Some(json!({ "page": 2 })))
        .await
        .unwrap();
    assert_eq!(replayed.status, StepRunStatus::PendingAssignment);
    assert_eq!(replayed.input, json!({ "page": 2 }));
    assert_eq!(step_named(&engine, &run.id, "publish").await.status, StepRunStatus::Pending);
    assert_eq!(status_of(&engine, &run.id).await, WorkflowRunStatus::Running);

    let finished = drive_to_completion(&engine, &worker, &run.id).await;
    assert_eq!(finished.status, WorkflowRunStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// Registration, triggers and timers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_step_timeouts_become_deadlines_only_when_representable() {
    let engine = engine().await;
    let oversized = r#"
name: slow
jobs:
  - name: main
    steps:
      - readable_id: only
        action: demo:step
        timeout_secs: 18446744073709551
"#;
    let err = engine
        .register_workflow(parse_declaration(oversized).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(err.kind(), ErrorKind::Precondition);

    register(&engine, &oversized.replace("18446744073709551", "90")).await;
    let worker = worker(&engine, 1).await;
    let run = engine
        .trigger_workflow(TriggerRequest::manual("slow", json!({})))
        .await
        .unwrap();
    engine.run_assignment_pass(assign_at()).await.unwrap();
    let only = step_named(&engine, &run.id, "only").await;
    let started = engine.start_step_run(&only.id, &worker.id).await.unwrap();
    let deadline = started.timeout_at.unwrap() - started.started_at.unwrap();
    assert_eq!(deadline, Duration::seconds(90));
}

#[tokio::test]
async fn test_reregistering_with_defaults_spelled_out_is_a_no_op() {
    let engine = engine().await;
    let first = engine.register_workflow(parse_declaration(SINGLE).unwrap()).await.unwrap();
    assert!(first.created);

    let explicit_defaults = r#"
name: single
jobs:
  - name: main
    steps:
      - readable_id: only
        action: demo:step
        is_durable: false
        slot_requests:
          default: 1
"#;
    let second = engine
        .register_workflow(parse_declaration(explicit_defaults).unwrap())
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(second.version.id, first.version.id);

    let durable = explicit_defaults.replace("is_durable: false", "is_durable: true");
    let third = engine.register_workflow(parse_declaration(&durable).unwrap()).await.unwrap();
    assert!(third.created);
    assert_eq!(third.version.version, 2);

    let gpu = SINGLE.replace(
        "action: demo:step",
        "action: demo:step\n        slot_requests:\n          gpu: 2",
    );
    let fourth = engine.register_workflow(parse_declaration(&gpu).unwrap()).await.unwrap();
    assert!(fourth.created);
    assert_ne!(fourth.version.checksum, first.version.checksum);
}

#[tokio::test]
async fn test_dedupe_value_is_unique_per_workflow() {
    let engine = engine().await;
    register(&engine, SINGLE).await;
    let request = TriggerRequest::manual("single", json!({})).with_dedupe("invoice-42");
    engine.trigger_workflow(request.clone()).await.unwrap();

    let err = engine.trigger_workflow(request).await.unwrap_err();
    assert!(matches!(err, EngineError::DuplicateDedupeValue(ref v) if v == "invoice-42"));
}

#[tokio::test]
async fn test_events_trigger_listening_workflows() {
    let engine = engine().await;
    register(
        &engine,
        r#"
name: on-order
event_triggers: ["order:created"]
jobs:
  - name: main
    steps:
      - readable_id: notify
        action: demo:step
"#,
    )
    .await;
    register(&engine, SINGLE).await;

    let (event, runs) = engine
        .push_event("order:created", json!({ "order": 7 }), BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].workflow_name, "on-order");
    assert_eq!(runs[0].input, json!({ "order": 7 }));
    assert_eq!(runs[0].trigger, RunTrigger::Event { event_id: event.id });

    let (_, none) = engine
        .push_event("order:shipped", json!({}), BTreeMap::new())
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn test_scheduled_run_fires_once() {
    let engine = engine().await;
    register(&engine, SINGLE).await;
    let ticker = engine.register_coordinator(OwnerKind::Ticker).await.unwrap();
    let timer = engine
        .schedule_workflow_run("single", Utc::now(), json!({ "nightly": true }))
        .await
        .unwrap();

    let timers = TimerScanner::new(engine.clone(), ticker.id);
    let report = timers.fire_due(Utc::now() + Duration::seconds(1)).await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.fired, 1);

    let report = timers.fire_due(Utc::now() + Duration::seconds(2)).await.unwrap();
    assert_eq!(report.fired, 0);

    let runs = engine.list_workflow_runs(&WorkflowRunFilter::default()).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].trigger, RunTrigger::Schedule { timer_id: timer.id });
    assert_eq!(runs[0].input, json!({ "nightly": true }));
}
