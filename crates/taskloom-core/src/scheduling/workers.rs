//! Worker, coordinator and rate-limit registration.

use std::collections::BTreeMap;

use chrono::Utc;
use taskloom_types::config::MAX_DURATION_SECS;
use taskloom_types::error::ValidationIssue;
use taskloom_types::ownership::{Coordinator, OwnerKind};
use taskloom_types::worker::{LabelValue, RateLimit, Worker, WorkerCapacity};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::EngineError;
use crate::repository::{OwnershipRepository, Store, WorkerRepository};

/// What a worker announces when it connects.
#[derive(Debug, Clone)]
pub struct WorkerRegistration {
    pub name: String,
    pub max_runs: u32,
    pub actions: Vec<String>,
    pub labels: BTreeMap<String, LabelValue>,
    /// Dispatcher the worker is connected through.
    pub dispatcher_id: Option<Uuid>,
}

impl WorkerRegistration {
    pub fn new(name: impl Into<String>, max_runs: u32, actions: Vec<String>) -> Self {
        Self {
            name: name.into(),
            max_runs,
            actions,
            labels: BTreeMap::new(),
            dispatcher_id: None,
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: LabelValue) -> Self {
        self.labels.insert(key.into(), value);
        self
    }

    pub fn via_dispatcher(mut self, dispatcher_id: Uuid) -> Self {
        self.dispatcher_id = Some(dispatcher_id);
        self
    }

    pub fn validate(&self) -> Result<(), Vec<ValidationIssue>> {
        let mut issues = Vec::new();
        if self.name.trim().is_empty() {
            issues.push(ValidationIssue::new("name", "must not be empty"));
        }
        if self.max_runs == 0 {
            issues.push(ValidationIssue::new("max_runs", "must be greater than zero"));
        }
        if self.actions.iter().any(|a| a.trim().is_empty()) {
            issues.push(ValidationIssue::new("actions", "must not contain empty action ids"));
        }
        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

impl<S: Store> Engine<S> {
    pub async fn register_worker(&self, registration: WorkerRegistration) -> Result<Worker, EngineError> {
        registration.validate().map_err(EngineError::Validation)?;
        let now = Utc::now();
        let worker = Worker {
            id: Uuid::now_v7(),
            name: registration.name,
            dispatcher_id: registration.dispatcher_id,
            max_runs: registration.max_runs,
            is_active: true,
            last_heartbeat_at: now,
            actions: registration.actions,
            labels: registration.labels,
            created_at: now,
        };
        let workers = self.store().workers();
        self.persist(|| workers.upsert_worker(&worker)).await?;
        tracing::info!(worker_id = %worker.id, name = %worker.name, max_runs = worker.max_runs, "worker registered");
        Ok(worker)
    }

    pub async fn heartbeat_worker(&self, id: &Uuid) -> Result<(), EngineError> {
        let workers = self.store().workers();
        let now = Utc::now();
        if self.persist(|| workers.heartbeat_worker(id, now)).await? {
            Ok(())
        } else {
            Err(EngineError::not_found("worker", id))
        }
    }

    /// Stop assigning to a worker. Units it holds are reassigned by the
    /// recovery scanner.
    pub async fn deactivate_worker(&self, id: &Uuid) -> Result<(), EngineError> {
        let workers = self.store().workers();
        if !self.persist(|| workers.set_worker_active(id, false)).await? {
            return Err(EngineError::not_found("worker", id));
        }
        tracing::info!(worker_id = %id, "worker deactivated");
        Ok(())
    }

    pub async fn get_worker(&self, id: &Uuid) -> Result<WorkerCapacity, EngineError> {
        let workers = self.store().workers();
        self.persist(|| workers.get_worker(id))
            .await?
            .ok_or_else(|| EngineError::not_found("worker", id))
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerCapacity>, EngineError> {
        let workers = self.store().workers();
        self.persist(|| workers.list_workers()).await
    }

    /// Define or resize a rate-limit budget. The budget starts full.
    pub async fn upsert_rate_limit(&self, key: &str, limit: i32, window_secs: u64) -> Result<RateLimit, EngineError> {
        let mut issues = Vec::new();
        if key.trim().is_empty() {
            issues.push(ValidationIssue::new("key", "must not be empty"));
        }
        if limit <= 0 {
            issues.push(ValidationIssue::new("limit", "must be greater than zero"));
        }
        if window_secs == 0 || window_secs > MAX_DURATION_SECS {
            issues.push(ValidationIssue::new(
                "window_secs",
                format!("must be between 1 and {MAX_DURATION_SECS}"),
            ));
        }
        if !issues.is_empty() {
            return Err(EngineError::Validation(issues));
        }

        let rate_limit = RateLimit::new(key, limit, window_secs, Utc::now());
        let workers = self.store().workers();
        self.persist(|| workers.upsert_rate_limit(&rate_limit)).await?;
        tracing::info!(%key, limit, window_secs, "rate limit defined");
        Ok(rate_limit)
    }

    /// Register this process as a dispatcher or ticker.
    pub async fn register_coordinator(&self, kind: OwnerKind) -> Result<Coordinator, EngineError> {
        let coordinator = Coordinator::new(kind, Utc::now());
        let ownership = self.store().ownership();
        self.persist(|| ownership.upsert_coordinator(&coordinator)).await?;
        tracing::info!(coordinator_id = %coordinator.id, kind = ?kind, "coordinator registered");
        Ok(coordinator)
    }

    pub async fn heartbeat_coordinator(&self, kind: OwnerKind, id: &Uuid) -> Result<(), EngineError> {
        let ownership = self.store().ownership();
        let now = Utc::now();
        if self.persist(|| ownership.heartbeat_coordinator(kind, id, now)).await? {
            Ok(())
        } else {
            Err(EngineError::not_found("coordinator", id))
        }
    }
}
