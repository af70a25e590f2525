//! Triggering workflow runs and ingesting events.
//!
//! A trigger persists the run with every job run, step run and parent edge
//! in one store call, announces the creation, and then hands the run to
//! admission: directly when the workflow declares no concurrency or the key
//! was evaluated inline, or after its group-key run finishes on a worker.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use taskloom_types::error::{RepositoryError, ValidationIssue};
use taskloom_types::event::{EngineEvent, Event};
use taskloom_types::run::{
    GetGroupKeyRun, JobKind, JobRun, JobRunStatus, MAX_PRIORITY, MIN_PRIORITY, RunTrigger,
    StepRun, StepRunStatus, WorkflowRun, WorkflowRunStatus,
};
use taskloom_types::workflow::{JobDeclaration, WorkflowVersion};
use uuid::Uuid;

use super::expression::GroupKeyEvaluator;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::repository::run::{NewWorkflowRun, UnitUpdate};
use crate::repository::{RunRepository, Store, WorkflowRepository};

/// Which workflow version a trigger targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowTarget {
    /// The latest version of the named workflow.
    Name(String),
    /// One exact version.
    Version(Uuid),
}

/// Everything needed to create a workflow run.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub target: WorkflowTarget,
    pub trigger: RunTrigger,
    pub input: Value,
    pub additional_metadata: BTreeMap<String, Value>,
    /// Falls back to the declaration's default priority, then the minimum.
    pub priority: Option<u8>,
    pub dedupe_value: Option<String>,
}

impl TriggerRequest {
    pub fn manual(workflow: impl Into<String>, input: Value) -> Self {
        Self {
            target: WorkflowTarget::Name(workflow.into()),
            trigger: RunTrigger::Manual,
            input,
            additional_metadata: BTreeMap::new(),
            priority: None,
            dedupe_value: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_dedupe(mut self, value: impl Into<String>) -> Self {
        self.dedupe_value = Some(value.into());
        self
    }

    /// Every problem with the request. Nothing is persisted for an invalid request.
    pub fn validate(&self) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        if !self.input.is_object() {
            issues.push(ValidationIssue::new("input", "must be a JSON object"));
        }
        if let Some(priority) = self.priority {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
                issues.push(ValidationIssue::new(
                    "priority",
                    format!("must be between {MIN_PRIORITY} and {MAX_PRIORITY}"),
                ));
            }
        }
        if self.dedupe_value.as_deref().is_some_and(|d| d.trim().is_empty()) {
            issues.push(ValidationIssue::new("dedupe_value", "must not be empty"));
        }
        if let WorkflowTarget::Name(name) = &self.target {
            if name.trim().is_empty() {
                issues.push(ValidationIssue::new("workflow", "must not be empty"));
            }
        }
        if let RunTrigger::ParentChild {
            child_key: Some(key),
            ..
        } = &self.trigger
        {
            if key.trim().is_empty() {
                issues.push(ValidationIssue::new("trigger.child_key", "must not be empty"));
            }
        }
        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    /// Children of one parent step are deduplicated by key, else by index.
    fn effective_dedupe(&self) -> Option<String> {
        if self.dedupe_value.is_some() {
            return self.dedupe_value.clone();
        }
        match &self.trigger {
            RunTrigger::ParentChild {
                parent_step_run_id,
                child_index,
                child_key,
                ..
            } => Some(match child_key {
                Some(key) => format!("child:{parent_step_run_id}:{key}"),
                None => format!("child:{parent_step_run_id}:#{child_index}"),
            }),
            _ => None,
        }
    }
}

impl<S: Store> Engine<S> {
    /// Create a workflow run and start it through admission.
    pub async fn trigger_workflow(&self, request: TriggerRequest) -> Result<WorkflowRun, EngineError> {
        request.validate().map_err(EngineError::Validation)?;
        let version = self.resolve_target(&request.target).await?;

        if let RunTrigger::ParentChild { parent_run_id, .. } = &request.trigger {
            let runs = self.store().runs();
            self.persist(|| runs.get_workflow_run(parent_run_id))
                .await?
                .ok_or_else(|| EngineError::not_found("parent workflow run", parent_run_id))?;
        }

        let new_run = build_run(&version, &request, Utc::now())?;
        let dedupe = new_run.run.dedupe_value.clone();
        let runs = self.store().runs();
        match self.persist(|| runs.create_workflow_run(&new_run)).await {
            Ok(()) => {}
            Err(EngineError::Repository(RepositoryError::Conflict(_))) if dedupe.is_some() => {
                return Err(EngineError::DuplicateDedupeValue(dedupe.unwrap_or_default()));
            }
            Err(e) => return Err(e),
        }

        let run = new_run.run;
        tracing::info!(
            workflow_run_id = %run.id,
            workflow = %run.workflow_name,
            trigger = ?run.trigger.kind(),
            "workflow run created"
        );
        self.emit(EngineEvent::WorkflowRunCreated {
            workflow_run_id: run.id,
            workflow_name: run.workflow_name.clone(),
            trigger: run.trigger.kind(),
        });

        match &new_run.group_key_run {
            Some(group_key_run) => self.queue_group_key_run(&group_key_run.id).await?,
            None => {
                self.admit_workflow_run(&run.id).await?;
            }
        }

        self.persist(|| runs.get_workflow_run(&run.id))
            .await?
            .ok_or_else(|| EngineError::not_found("workflow run", &run.id))
    }

    /// Persist a client event and trigger every workflow listening for its key.
    ///
    /// A workflow that fails to trigger is logged and skipped; the event and
    /// the other runs stand.
    pub async fn push_event(
        &self,
        key: &str,
        data: Value,
        additional_metadata: BTreeMap<String, Value>,
    ) -> Result<(Event, Vec<WorkflowRun>), EngineError> {
        if key.trim().is_empty() {
            return Err(EngineError::Validation(vec![ValidationIssue::new(
                "key",
                "must not be empty",
            )]));
        }
        let event = Event {
            id: Uuid::now_v7(),
            key: key.to_string(),
            data,
            additional_metadata,
            created_at: Utc::now(),
        };
        let runs = self.store().runs();
        self.persist(|| runs.create_event(&event)).await?;
        self.emit(EngineEvent::EventCreated {
            event_id: event.id,
            key: event.key.clone(),
        });

        let workflows = self.store().workflows();
        let versions = self
            .persist(|| workflows.list_latest_versions_for_event(key))
            .await?;

        let mut triggered = Vec::with_capacity(versions.len());
        for version in versions {
            let request = TriggerRequest {
                target: WorkflowTarget::Version(version.id),
                trigger: RunTrigger::Event { event_id: event.id },
                input: event.data.clone(),
                additional_metadata: event.additional_metadata.clone(),
                priority: None,
                dedupe_value: None,
            };
            match self.trigger_workflow(request).await {
                Ok(run) => triggered.push(run),
                Err(e) => tracing::warn!(
                    event_id = %event.id,
                    workflow = %version.declaration.name,
                    error = %e,
                    "event trigger failed"
                ),
            }
        }
        Ok((event, triggered))
    }

    async fn resolve_target(&self, target: &WorkflowTarget) -> Result<WorkflowVersion, EngineError> {
        match target {
            WorkflowTarget::Name(name) => self.latest_workflow_version(name).await,
            WorkflowTarget::Version(id) => {
                let workflows = self.store().workflows();
                self.persist(|| workflows.get_version(id))
                    .await?
                    .ok_or_else(|| EngineError::not_found("workflow version", id))
            }
        }
    }

    /// PENDING -> PENDING_ASSIGNMENT for a freshly created group-key run.
    pub(crate) async fn queue_group_key_run(&self, id: &Uuid) -> Result<(), EngineError> {
        let now = Utc::now();
        let update = UnitUpdate::to(StepRunStatus::PendingAssignment)
            .schedule_timeout_at(now + self.config().scheduling.schedule_timeout())
            .requeue_after(now);
        let runs = self.store().runs();
        let queued = self
            .persist(|| runs.transition_group_key_run(id, &[StepRunStatus::Pending], &update))
            .await?;
        if queued.is_none() {
            return Err(EngineError::StepRunIsNotPending(*id));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Run construction
// ---------------------------------------------------------------------------

fn build_run(
    version: &WorkflowVersion,
    request: &TriggerRequest,
    now: DateTime<Utc>,
) -> Result<NewWorkflowRun, EngineError> {
    let declaration = &version.declaration;
    let run_id = Uuid::now_v7();
    let priority = request
        .priority
        .or(declaration.default_priority)
        .unwrap_or(MIN_PRIORITY);

    let mut group_key = None;
    let mut group_key_run = None;
    if let Some(concurrency) = &declaration.concurrency {
        if let Some(expression) = &concurrency.expression {
            let key = GroupKeyEvaluator::new().evaluate(
                expression,
                &request.input,
                &request.additional_metadata,
            )?;
            group_key = Some(key);
        } else if let Some(action) = &concurrency.action {
            group_key_run = Some(GetGroupKeyRun {
                id: Uuid::now_v7(),
                workflow_run_id: run_id,
                action_id: action.clone(),
                status: StepRunStatus::Pending,
                input: json!({
                    "input": request.input,
                    "additional_metadata": request.additional_metadata,
                }),
                output: None,
                error: None,
                requeue_count: 0,
                schedule_timeout_at: None,
                worker_id: None,
                dispatcher_id: None,
                assigned_at: None,
                created_at: now,
                started_at: None,
                finished_at: None,
            });
        }
    }

    let mut jobs = Vec::new();
    let mut steps = Vec::new();
    let declared = declaration
        .jobs
        .iter()
        .map(|job| (job, JobKind::Default))
        .chain(declaration.on_failure_job.iter().map(|job| (job, JobKind::OnFailure)));
    for (job, kind) in declared {
        let job_run = JobRun {
            id: Uuid::now_v7(),
            workflow_run_id: run_id,
            job_name: job.name.clone(),
            kind,
            status: JobRunStatus::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
        };
        steps.extend(build_steps(job, &job_run, &request.input, priority, now));
        jobs.push(job_run);
    }

    let run = WorkflowRun {
        id: run_id,
        workflow_id: version.workflow_id,
        workflow_version_id: version.id,
        workflow_name: declaration.name.clone(),
        status: WorkflowRunStatus::Pending,
        trigger: request.trigger.clone(),
        input: request.input.clone(),
        additional_metadata: request.additional_metadata.clone(),
        dedupe_value: request.effective_dedupe(),
        priority,
        concurrency_group_key: group_key,
        sticky_worker_id: None,
        error: None,
        created_at: now,
        started_at: None,
        finished_at: None,
        deleted_at: None,
    };

    Ok(NewWorkflowRun {
        run,
        jobs,
        steps,
        group_key_run,
    })
}

fn build_steps(
    job: &JobDeclaration,
    job_run: &JobRun,
    input: &Value,
    priority: u8,
    now: DateTime<Utc>,
) -> Vec<StepRun> {
    let ids: HashMap<&str, Uuid> = job
        .steps
        .iter()
        .map(|s| (s.readable_id.as_str(), Uuid::now_v7()))
        .collect();

    job.steps
        .iter()
        .map(|step| {
            let mut rate_limits = BTreeMap::new();
            for limit in &step.rate_limits {
                *rate_limits.entry(limit.key.clone()).or_insert(0) += limit.units;
            }
            StepRun {
                id: ids[step.readable_id.as_str()],
                workflow_run_id: job_run.workflow_run_id,
                job_run_id: job_run.id,
                step_name: step.readable_id.clone(),
                action_id: step.action.clone(),
                status: StepRunStatus::Pending,
                parent_ids: step
                    .parents
                    .iter()
                    .filter_map(|p| ids.get(p.as_str()).copied())
                    .collect(),
                input: input.clone(),
                output: None,
                error: None,
                priority,
                retry_count: 0,
                max_retries: step.retries,
                requeue_count: 0,
                timeout_secs: step.timeout_secs,
                schedule_timeout_at: None,
                timeout_at: None,
                requeue_after: None,
                worker_id: None,
                dispatcher_id: None,
                assigned_at: None,
                slot_units: step.slot_units(),
                rate_limits,
                desired_labels: step.desired_labels.clone(),
                created_at: now,
                started_at: None,
                finished_at: None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use taskloom_types::workflow::WorkflowDeclaration;

    use super::*;

    fn version(declaration: serde_json::Value) -> WorkflowVersion {
        let declaration: WorkflowDeclaration = serde_json::from_value(declaration).unwrap();
        WorkflowVersion {
            id: Uuid::now_v7(),
            workflow_id: Uuid::now_v7(),
            version: 1,
            checksum: "x".to_string(),
            declaration,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_request_validation_collects_issues() {
        let request = TriggerRequest::manual("", json!([1]))
            .with_priority(5)
            .with_dedupe(" ");
        let issues = request.validate().unwrap_err();
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["input", "priority", "dedupe_value", "workflow"]);
    }

    #[test]
    fn test_build_run_wires_parents_and_jobs() {
        let version = version(json!({
            "name": "wf",
            "default_priority": 2,
            "jobs": [{"name": "main", "steps": [
                {"readable_id": "a", "action": "do:a", "retries": 2},
                {"readable_id": "b", "action": "do:b", "parents": ["a"],
                 "rate_limits": [{"key": "api", "units": 2}, {"key": "api"}]},
            ]}],
            "on_failure_job": {"name": "cleanup", "steps": [{"readable_id": "c", "action": "do:c"}]},
        }));
        let request = TriggerRequest::manual("wf", json!({"n": 1}));
        let new_run = build_run(&version, &request, Utc::now()).unwrap();

        assert_eq!(new_run.run.priority, 2);
        assert_eq!(new_run.jobs.len(), 2);
        assert_eq!(new_run.jobs[1].kind, JobKind::OnFailure);
        let a = &new_run.steps[0];
        let b = &new_run.steps[1];
        assert_eq!(a.max_retries, 2);
        assert_eq!(b.parent_ids, vec![a.id]);
        assert_eq!(b.rate_limits["api"], 3);
        assert!(new_run.group_key_run.is_none());
    }

    #[test]
    fn test_inline_group_key_is_evaluated_up_front() {
        let version = version(json!({
            "name": "wf",
            "concurrency": {"expression": "input.tenant"},
            "jobs": [{"name": "main", "steps": [{"readable_id": "a", "action": "do:a"}]}],
        }));
        let request = TriggerRequest::manual("wf", json!({"tenant": "acme"}));
        let new_run = build_run(&version, &request, Utc::now()).unwrap();
        assert_eq!(new_run.run.concurrency_group_key.as_deref(), Some("acme"));

        let bad = TriggerRequest::manual("wf", json!({}));
        assert!(matches!(build_run(&version, &bad, Utc::now()), Err(EngineError::Expression(_))));
    }

    #[test]
    fn test_action_group_key_creates_group_key_run() {
        let version = version(json!({
            "name": "wf",
            "concurrency": {"action": "key:get", "limit_strategy": "queue_newest"},
            "jobs": [{"name": "main", "steps": [{"readable_id": "a", "action": "do:a"}]}],
        }));
        let new_run = build_run(&version, &TriggerRequest::manual("wf", json!({})), Utc::now()).unwrap();
        let group_key_run = new_run.group_key_run.unwrap();
        assert_eq!(group_key_run.action_id, "key:get");
        assert_eq!(group_key_run.workflow_run_id, new_run.run.id);
        assert!(new_run.run.concurrency_group_key.is_none());
    }

    #[test]
    fn test_child_runs_dedupe_by_key() {
        let parent_step = Uuid::now_v7();
        let mut request = TriggerRequest::manual("wf", json!({}));
        request.trigger = RunTrigger::ParentChild {
            parent_run_id: Uuid::now_v7(),
            parent_step_run_id: parent_step,
            child_index: 3,
            child_key: None,
        };
        assert_eq!(request.effective_dedupe(), Some(format!("child:{parent_step}:#3")));
    }
}
