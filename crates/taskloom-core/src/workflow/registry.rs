//! Workflow registration.
//!
//! Registering a declaration whose checksum matches the latest version of
//! that workflow is a no-op that returns the existing version. Anything else
//! becomes the next numbered version and replaces the workflow's cron timers.

use chrono::Utc;
use taskloom_types::error::ValidationIssue;
use taskloom_types::ownership::{TimerSchedule, WorkflowTimer};
use taskloom_types::workflow::{WorkflowDeclaration, WorkflowSummary, WorkflowVersion};
use uuid::Uuid;

use super::checksum::checksum;
use super::validate::validate_declaration;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::repository::{OwnershipRepository, Store, WorkflowRepository};

/// Outcome of [`Engine::register_workflow`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub version: WorkflowVersion,
    /// `false` when an identical declaration was already the latest version.
    pub created: bool,
}

/// Parse a YAML (or JSON) workflow declaration. Validation is separate.
pub fn parse_declaration(text: &str) -> Result<WorkflowDeclaration, EngineError> {
    serde_yaml_ng::from_str(text)
        .map_err(|e| EngineError::Validation(vec![ValidationIssue::new("declaration", e.to_string())]))
}

/// Two registrations of the same workflow racing for the next version number.
const REGISTER_ATTEMPTS: u32 = 3;

impl<S: Store> Engine<S> {
    pub async fn register_workflow(
        &self,
        declaration: WorkflowDeclaration,
    ) -> Result<Registration, EngineError> {
        let issues = validate_declaration(&declaration);
        if !issues.is_empty() {
            return Err(EngineError::Validation(issues));
        }
        let checksum = checksum(&declaration, self.hasher())?;

        let workflows = self.store().workflows();
        let workflow = self
            .persist(|| workflows.upsert_workflow(&declaration.name, Utc::now()))
            .await?;

        let mut attempt = 1;
        loop {
            let latest = self.persist(|| workflows.latest_version(&workflow.id)).await?;
            if let Some(latest) = latest.as_ref().filter(|v| v.checksum == checksum) {
                tracing::debug!(workflow = %workflow.name, version = latest.version, "declaration unchanged");
                return Ok(Registration {
                    version: latest.clone(),
                    created: false,
                });
            }

            let now = Utc::now();
            let version = WorkflowVersion {
                id: Uuid::now_v7(),
                workflow_id: workflow.id,
                version: latest.map(|v| v.version + 1).unwrap_or(1),
                checksum: checksum.clone(),
                declaration: declaration.clone(),
                created_at: now,
            };
            match self.persist(|| workflows.create_version(&version)).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() && attempt < REGISTER_ATTEMPTS => {
                    attempt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let timers: Vec<WorkflowTimer> = declaration
                .cron_triggers
                .iter()
                .map(|expression| WorkflowTimer {
                    id: Uuid::now_v7(),
                    workflow_id: workflow.id,
                    workflow_version_id: version.id,
                    schedule: TimerSchedule::Cron {
                        expression: expression.clone(),
                    },
                    input: declaration
                        .cron_input
                        .clone()
                        .unwrap_or_else(|| serde_json::json!({})),
                    ticker_id: None,
                    last_fired_at: None,
                    created_at: now,
                })
                .collect();
            let ownership = self.store().ownership();
            self.persist(|| ownership.replace_cron_timers(&workflow.id, &timers))
                .await?;

            tracing::info!(
                workflow = %workflow.name,
                version = version.version,
                cron_timers = timers.len(),
                "registered workflow version"
            );
            return Ok(Registration {
                version,
                created: true,
            });
        }
    }

    /// The latest version of the named workflow.
    pub async fn latest_workflow_version(&self, name: &str) -> Result<WorkflowVersion, EngineError> {
        let workflows = self.store().workflows();
        let workflow = self
            .persist(|| workflows.get_workflow_by_name(name))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("workflow '{name}'")))?;
        self.persist(|| workflows.latest_version(&workflow.id))
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("version of workflow '{name}'")))
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, EngineError> {
        let workflows = self.store().workflows();
        self.persist(|| workflows.list_workflows()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_declaration_accepts_json_and_yaml() {
        let yaml = "name: wf\njobs:\n  - name: main\n    steps:\n      - readable_id: a\n        action: do:a\n";
        let json = r#"{"name":"wf","jobs":[{"name":"main","steps":[{"readable_id":"a","action":"do:a"}]}]}"#;
        assert_eq!(parse_declaration(yaml).unwrap(), parse_declaration(json).unwrap());
    }

    #[test]
    fn test_parse_declaration_reports_syntax_errors() {
        let err = parse_declaration("name: [unclosed").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
