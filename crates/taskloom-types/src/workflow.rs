//! Workflow declaration and version types.
//!
//! A `WorkflowDeclaration` is what clients register (YAML or JSON). Each
//! distinct declaration of a workflow name becomes a numbered
//! `WorkflowVersion`, identified for deduplication by its checksum.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::worker::DesiredLabel;

// ---------------------------------------------------------------------------
// Declaration
// ---------------------------------------------------------------------------

/// A workflow as declared by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Free-form version label chosen by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Event keys that trigger a run.
    #[serde(default)]
    pub event_triggers: Vec<String>,
    /// Cron expressions that trigger a run.
    #[serde(default)]
    pub cron_triggers: Vec<String>,
    /// Input passed to cron-triggered runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<ConcurrencyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sticky: Option<StickyStrategy>,
    /// Priority for runs that do not request one (1-3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_priority: Option<u8>,
    pub jobs: Vec<JobDeclaration>,
    /// Runs only when a default job fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure_job: Option<JobDeclaration>,
}

impl WorkflowDeclaration {
    /// Default jobs followed by the on-failure job, if any.
    pub fn all_jobs(&self) -> impl Iterator<Item = &JobDeclaration> {
        self.jobs.iter().chain(self.on_failure_job.iter())
    }
}

/// A named group of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<StepDeclaration>,
}

/// One step in a job's DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepDeclaration {
    /// Unique within the job.
    pub readable_id: String,
    /// The action a worker must declare to run this step.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Readable ids of steps in the same job this step depends on.
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitRequest>,
    #[serde(default)]
    pub desired_labels: BTreeMap<String, DesiredLabel>,
    #[serde(default)]
    pub is_durable: bool,
    /// Slot units requested per slot type. Empty means one default slot.
    #[serde(default)]
    pub slot_requests: BTreeMap<String, u32>,
}

impl StepDeclaration {
    /// Total worker slot units this step occupies.
    pub fn slot_units(&self) -> u32 {
        if self.slot_requests.is_empty() {
            1
        } else {
            self.slot_requests.values().sum()
        }
    }
}

/// Units of a named rate limit consumed when the step is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RateLimitRequest {
    pub key: String,
    #[serde(default = "default_units")]
    pub units: i32,
}

fn default_units() -> i32 {
    1
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

/// Concurrency limit for runs of a workflow sharing a group key.
///
/// Exactly one of `expression` (evaluated inline against the run input) or
/// `action` (evaluated by a worker as a group-key run) must be set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ConcurrencyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default = "default_max_runs")]
    pub max_runs: u32,
    #[serde(default)]
    pub limit_strategy: LimitStrategy,
}

fn default_max_runs() -> u32 {
    1
}

/// What happens to a candidate run when its group is at capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LimitStrategy {
    #[default]
    CancelInProgress,
    DropNewest,
    QueueNewest,
    GroupRoundRobin,
}

/// Whether a workflow's steps prefer (soft) or require (hard) the worker that
/// ran its first step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StickyStrategy {
    Soft,
    Hard,
}

// ---------------------------------------------------------------------------
// Persisted workflow / version
// ---------------------------------------------------------------------------

/// A registered workflow name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// An immutable, numbered declaration of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub workflow_id: Uuid,
    /// 1-based, increasing per workflow.
    pub version: u32,
    pub checksum: String,
    pub declaration: WorkflowDeclaration,
    pub created_at: DateTime<Utc>,
}

/// Listing row for registered workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: Uuid,
    pub name: String,
    pub latest_version: u32,
    pub latest_checksum: String,
    pub updated_at: DateTime<Utc>,
}
