//! Workflow repository trait definition.
//!
//! Stores registered workflow names and their immutable, numbered versions.

use chrono::{DateTime, Utc};
use taskloom_types::error::RepositoryError;
use taskloom_types::workflow::{Workflow, WorkflowSummary, WorkflowVersion};
use uuid::Uuid;

/// Repository trait for workflow registration.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowRepository: Send + Sync {
    /// Return the workflow with this name, creating it if missing.
    fn upsert_workflow(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Workflow, RepositoryError>> + Send;

    fn get_workflow_by_name(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<Workflow>, RepositoryError>> + Send;

    /// The highest-numbered version of a workflow.
    fn latest_version(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowVersion>, RepositoryError>> + Send;

    fn get_version(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowVersion>, RepositoryError>> + Send;

    /// Insert a version and index its event triggers.
    ///
    /// Fails with `Conflict` if the version number is already taken, which
    /// happens when two registrations of the same workflow race.
    fn create_version(
        &self,
        version: &WorkflowVersion,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn list_workflows(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowSummary>, RepositoryError>> + Send;

    /// Latest versions of every workflow whose latest version declares `event_key`.
    fn list_latest_versions_for_event(
        &self,
        event_key: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowVersion>, RepositoryError>> + Send;
}
