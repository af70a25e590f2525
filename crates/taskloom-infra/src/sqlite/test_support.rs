//! Fixtures shared by the SQLite repository tests.

use std::collections::BTreeMap;

use chrono::Utc;
use taskloom_core::repository::run::NewWorkflowRun;
use taskloom_core::repository::{WorkerRepository, WorkflowRepository};
use taskloom_types::run::{
    GetGroupKeyRun, JobKind, JobRun, JobRunStatus, RunTrigger, StepRun, StepRunStatus, WorkflowRun,
    WorkflowRunStatus,
};
use taskloom_types::worker::Worker;
use taskloom_types::workflow::{ConcurrencyConfig, WorkflowDeclaration, WorkflowVersion};
use uuid::Uuid;

use super::pool::{DatabasePool, database_url};
use super::worker::SqliteWorkerRepository;
use super::workflow::SqliteWorkflowRepository;

/// A migrated database in a temp dir that outlives the test.
pub(crate) async fn test_pool() -> DatabasePool {
    let dir = tempfile::tempdir().unwrap();
    let url = database_url(dir.path());
    std::mem::forget(dir);
    DatabasePool::new(&url).await.unwrap()
}

/// A registered workflow version to hang runs off.
pub(crate) struct RunFixture {
    pub workflow_id: Uuid,
    pub version_id: Uuid,
    pub workflow_name: String,
}

pub(crate) async fn seed_workflow(pool: &DatabasePool, concurrency: Option<ConcurrencyConfig>) -> RunFixture {
    let repo = SqliteWorkflowRepository::new(pool.clone());
    let workflow = repo.upsert_workflow("fixture", Utc::now()).await.unwrap();
    let mut declaration: WorkflowDeclaration = serde_json::from_value(serde_json::json!({
        "name": "fixture",
        "jobs": [{"name": "main", "steps": [
            {"readable_id": "first", "action": "demo:step"},
            {"readable_id": "second", "action": "demo:step", "rate_limits": [{"key": "api"}]},
            {"readable_id": "after", "action": "demo:step", "parents": ["first", "second"]}
        ]}]
    }))
    .unwrap();
    declaration.concurrency = concurrency;
    let version = WorkflowVersion {
        id: Uuid::now_v7(),
        workflow_id: workflow.id,
        version: 1,
        checksum: "fixture".to_string(),
        declaration,
        created_at: Utc::now(),
    };
    repo.create_version(&version).await.unwrap();
    RunFixture {
        workflow_id: workflow.id,
        version_id: version.id,
        workflow_name: workflow.name,
    }
}

impl RunFixture {
    fn run(&self, dedupe: Option<&str>, group_key: Option<&str>) -> WorkflowRun {
        WorkflowRun {
            id: Uuid::now_v7(),
            workflow_id: self.workflow_id,
            workflow_version_id: self.version_id,
            workflow_name: self.workflow_name.clone(),
            status: WorkflowRunStatus::Pending,
            trigger: RunTrigger::Manual,
            input: serde_json::json!({"n": 1}),
            additional_metadata: BTreeMap::new(),
            dedupe_value: dedupe.map(str::to_string),
            priority: 1,
            concurrency_group_key: group_key.map(str::to_string),
            sticky_worker_id: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            deleted_at: None,
        }
    }

    fn step(run: &WorkflowRun, job: &JobRun, name: &str, parents: Vec<Uuid>) -> StepRun {
        StepRun {
            id: Uuid::now_v7(),
            workflow_run_id: run.id,
            job_run_id: job.id,
            step_name: name.to_string(),
            action_id: "demo:step".to_string(),
            status: StepRunStatus::Pending,
            parent_ids: parents,
            input: serde_json::json!({}),
            output: None,
            error: None,
            priority: run.priority,
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

    /// A run with one job of three steps: `first` and `second` feed `after`.
    pub fn new_run(&self, dedupe: Option<&str>, group_key: Option<&str>) -> NewWorkflowRun {
        let run = self.run(dedupe, group_key);
        let job = JobRun {
            id: Uuid::now_v7(),
            workflow_run_id: run.id,
            job_name: "main".to_string(),
            kind: JobKind::Default,
            status: JobRunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let first = Self::step(&run, &job, "first", vec![]);
        let mut second = Self::step(&run, &job, "second", vec![]);
        second.rate_limits.insert("api".to_string(), 1);
        let after = Self::step(&run, &job, "after", vec![first.id, second.id]);
        NewWorkflowRun {
            run,
            jobs: vec![job],
            steps: vec![first, second, after],
            group_key_run: None,
        }
    }

    /// A keyless run whose group key is evaluated by a worker.
    pub fn new_run_with_group_key_run(&self) -> NewWorkflowRun {
        let mut new_run = self.new_run(None, None);
        new_run.group_key_run = Some(GetGroupKeyRun {
            id: Uuid::now_v7(),
            workflow_run_id: new_run.run.id,
            action_id: "demo:key".to_string(),
            status: StepRunStatus::Pending,
            input: new_run.run.input.clone(),
            output: None,
            error: None,
            requeue_count: 0,
            schedule_timeout_at: None,
            worker_id: None,
            dispatcher_id: None,
            assigned_at: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        });
        new_run
    }
}

/// Register a live worker declaring `actions`.
pub(crate) async fn seed_worker(repo: &SqliteWorkerRepository, max_runs: u32, actions: &[&str]) -> Worker {
    let now = Utc::now();
    let worker = Worker {
        id: Uuid::now_v7(),
        name: "fixture-worker".to_string(),
        dispatcher_id: None,
        max_runs,
        is_active: true,
        last_heartbeat_at: now,
        actions: actions.iter().map(|a| a.to_string()).collect(),
        labels: BTreeMap::new(),
        created_at: now,
    };
    repo.upsert_worker(&worker).await.unwrap();
    worker
}
