//! SQLite workflow repository implementation.
//!
//! Workflows are named rows; each registered declaration is an immutable,
//! numbered version stored as a JSON blob with its checksum. Event keys are
//! indexed separately so event triggers resolve without parsing declarations.

use chrono::{DateTime, Utc};
use sqlx::Row;
use taskloom_core::repository::workflow::WorkflowRepository;
use taskloom_types::error::RepositoryError;
use taskloom_types::workflow::{Workflow, WorkflowSummary, WorkflowVersion};
use uuid::Uuid;

use super::codec::{db_err, format_datetime, from_json, parse_datetime, parse_uuid, to_json, to_u32};
use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowRepository`.
#[derive(Clone)]
pub struct SqliteWorkflowRepository {
    pool: DatabasePool,
}

impl SqliteWorkflowRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct VersionRow {
    id: String,
    workflow_id: String,
    version: i64,
    checksum: String,
    declaration: String,
    created_at: String,
}

impl VersionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_id: row.try_get("workflow_id")?,
            version: row.try_get("version")?,
            checksum: row.try_get("checksum")?,
            declaration: row.try_get("declaration")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_version(self) -> Result<WorkflowVersion, RepositoryError> {
        Ok(WorkflowVersion {
            id: parse_uuid(&self.id)?,
            workflow_id: parse_uuid(&self.workflow_id)?,
            version: to_u32(self.version, "version")?,
            checksum: self.checksum,
            declaration: from_json(&self.declaration, "declaration")?,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn row_to_version(row: &sqlx::sqlite::SqliteRow) -> Result<WorkflowVersion, RepositoryError> {
    VersionRow::from_row(row).map_err(db_err)?.into_version()
}

fn row_to_workflow(row: &sqlx::sqlite::SqliteRow) -> Result<Workflow, RepositoryError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    Ok(Workflow {
        id: parse_uuid(&id)?,
        name: row.try_get("name").map_err(db_err)?,
        created_at: parse_datetime(&created_at)?,
    })
}

// ---------------------------------------------------------------------------
// WorkflowRepository impl
// ---------------------------------------------------------------------------

impl WorkflowRepository for SqliteWorkflowRepository {
    async fn upsert_workflow(&self, name: &str, now: DateTime<Utc>) -> Result<Workflow, RepositoryError> {
        sqlx::query(
            "INSERT INTO workflows (id, name, created_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(name)
        .bind(format_datetime(&now))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;

        // Read back on the writer so the row just inserted is visible.
        let row = sqlx::query("SELECT id, name, created_at FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool.writer)
            .await
            .map_err(db_err)?;
        row_to_workflow(&row)
    }

    async fn get_workflow_by_name(&self, name: &str) -> Result<Option<Workflow>, RepositoryError> {
        let row = sqlx::query("SELECT id, name, created_at FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_workflow).transpose()
    }

    async fn latest_version(&self, workflow_id: &Uuid) -> Result<Option<WorkflowVersion>, RepositoryError> {
        let row = sqlx::query(
            "SELECT * FROM workflow_versions WHERE workflow_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(workflow_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_version).transpose()
    }

    async fn get_version(&self, id: &Uuid) -> Result<Option<WorkflowVersion>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_versions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_version).transpose()
    }

    async fn create_version(&self, version: &WorkflowVersion) -> Result<(), RepositoryError> {
        let declaration = to_json(&version.declaration)?;
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT INTO workflow_versions (id, workflow_id, version, checksum, declaration, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(version.id.to_string())
        .bind(version.workflow_id.to_string())
        .bind(i64::from(version.version))
        .bind(&version.checksum)
        .bind(&declaration)
        .bind(format_datetime(&version.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for key in &version.declaration.event_triggers {
            sqlx::query(
                "INSERT OR IGNORE INTO workflow_event_triggers (version_id, event_key) VALUES (?, ?)",
            )
            .bind(version.id.to_string())
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT w.id, w.name, v.version, v.checksum, v.created_at
               FROM workflows w
               JOIN workflow_versions v ON v.workflow_id = w.id
               WHERE v.version = (SELECT MAX(version) FROM workflow_versions WHERE workflow_id = w.id)
               ORDER BY w.name"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id").map_err(db_err)?;
                let version: i64 = row.try_get("version").map_err(db_err)?;
                let created_at: String = row.try_get("created_at").map_err(db_err)?;
                Ok(WorkflowSummary {
                    id: parse_uuid(&id)?,
                    name: row.try_get("name").map_err(db_err)?,
                    latest_version: to_u32(version, "version")?,
                    latest_checksum: row.try_get("checksum").map_err(db_err)?,
                    updated_at: parse_datetime(&created_at)?,
                })
            })
            .collect()
    }

    async fn list_latest_versions_for_event(
        &self,
        event_key: &str,
    ) -> Result<Vec<WorkflowVersion>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT v.*
               FROM workflow_versions v
               JOIN workflow_event_triggers t ON t.version_id = v.id
               WHERE t.event_key = ?
                 AND v.version = (SELECT MAX(version) FROM workflow_versions WHERE workflow_id = v.workflow_id)
               ORDER BY v.created_at, v.id"#,
        )
        .bind(event_key)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_version).collect()
    }
}
