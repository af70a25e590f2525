//! Ingested events, engine notifications and analytics records.
//!
//! `EngineEvent` is broadcast on the engine event bus and handed to create
//! callbacks. All variants are Clone + Send + Sync for use with tokio
//! broadcast channels.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::{StepRunStatus, TriggerKind, UnitKind, WorkflowRunStatus};

/// An event pushed by a client. Workflows declaring its key are triggered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub key: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub additional_metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Notifications emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A workflow run was persisted.
    WorkflowRunCreated {
        workflow_run_id: Uuid,
        workflow_name: String,
        trigger: TriggerKind,
    },

    /// A client event was persisted.
    EventCreated { event_id: Uuid, key: String },

    /// A workflow run changed status.
    WorkflowRunStatusChanged {
        workflow_run_id: Uuid,
        status: WorkflowRunStatus,
    },

    /// A step run changed status.
    StepRunStatusChanged {
        step_run_id: Uuid,
        workflow_run_id: Uuid,
        status: StepRunStatus,
    },

    /// A run was bound to a worker slot.
    UnitAssigned {
        kind: UnitKind,
        unit_id: Uuid,
        worker_id: Uuid,
    },
}

impl EngineEvent {
    /// The workflow run the event concerns, if any.
    pub fn workflow_run_id(&self) -> Option<Uuid> {
        match self {
            EngineEvent::WorkflowRunCreated { workflow_run_id, .. }
            | EngineEvent::WorkflowRunStatusChanged { workflow_run_id, .. }
            | EngineEvent::StepRunStatusChanged { workflow_run_id, .. } => Some(*workflow_run_id),
            EngineEvent::EventCreated { .. } | EngineEvent::UnitAssigned { .. } => None,
        }
    }

    /// Creation events are the ones delivered to create callbacks.
    pub fn is_creation(&self) -> bool {
        matches!(
            self,
            EngineEvent::WorkflowRunCreated { .. } | EngineEvent::EventCreated { .. }
        )
    }
}

/// What an analytics record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsKind {
    WorkflowRunFinished,
    StepRunFinished,
    GroupKeyRunFinished,
    AdmissionDropped,
}

/// One append-only analytics row for a terminal-state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub kind: AnalyticsKind,
    pub resource_id: Uuid,
    pub workflow_run_id: Uuid,
    /// Terminal status in its storage spelling.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_event_tagging() {
        let event = EngineEvent::EventCreated {
            event_id: Uuid::now_v7(),
            key: "user:signup".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "event_created");
        assert!(event.is_creation());

        let status = EngineEvent::WorkflowRunStatusChanged {
            workflow_run_id: Uuid::now_v7(),
            status: WorkflowRunStatus::Running,
        };
        assert!(!status.is_creation());
    }

    #[test]
    fn test_analytics_record_json_line() {
        let record = AnalyticsRecord {
            kind: AnalyticsKind::StepRunFinished,
            resource_id: Uuid::now_v7(),
            workflow_run_id: Uuid::now_v7(),
            status: "failed".to_string(),
            error: Some("boom".to_string()),
            occurred_at: Utc::now(),
        };
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"kind\":\"step_run_finished\""));
    }
}
