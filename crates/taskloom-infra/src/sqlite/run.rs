//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `taskloom-core`. Every status change is an
//! `UPDATE ... WHERE status IN (...) RETURNING *` on the writer pool, so a
//! transition whose guard no longer holds changes nothing and reports `None`.
//! Multi-row operations (run creation, admission plans, slot assignment,
//! replay resets) run in one transaction on the single writer connection.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use taskloom_core::repository::SortOrder;
use taskloom_core::repository::run::{
    AdmissionPlan, AdmissionScope, AssignOutcome, NewWorkflowRun, ReplayReset, RunRepository,
    SlotRequest, UnitUpdate, WorkflowRunFilter, WorkflowRunUpdate,
};
use taskloom_types::error::RepositoryError;
use taskloom_types::event::Event;
use taskloom_types::run::{
    GetGroupKeyRun, JobRun, JobRunStatus, StepRun, StepRunStatus, UnitKind, UnitRef, WorkflowRun,
    WorkflowRunStatus,
};
use uuid::Uuid;

use super::codec::{
    col, db_err, enum_name, enum_names, format_datetime, format_opt_datetime, from_json, parse_datetime,
    parse_enum, parse_opt_datetime, parse_opt_uuid, parse_uuid, push_in, to_json, to_u32,
};
use super::pool::DatabasePool;
use super::worker::row_to_rate_limit;

/// Error recorded on RUNNING runs cancelled to admit a newer one.
pub const CANCELLED_BY_NEWER_RUN: &str = "cancelled by a newer run in its concurrency group";
/// Error recorded on PENDING runs rejected at the concurrency limit.
pub const DROPPED_AT_LIMIT: &str = "dropped: concurrency limit reached";

/// SQLite-backed implementation of `RunRepository`.
#[derive(Clone)]
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    /// Create a new repository backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Unit tables
// ---------------------------------------------------------------------------

/// The two tables whose rows can hold a worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitTable {
    Step,
    GroupKey,
}

impl UnitTable {
    fn for_kind(kind: UnitKind) -> Self {
        match kind {
            UnitKind::StepRun => UnitTable::Step,
            UnitKind::GroupKeyRun => UnitTable::GroupKey,
        }
    }

    fn name(self) -> &'static str {
        match self {
            UnitTable::Step => "step_runs",
            UnitTable::GroupKey => "group_key_runs",
        }
    }

    /// Step outputs are JSON documents; a group-key output is the key itself.
    fn encode_output(self, output: &serde_json::Value) -> Result<String, RepositoryError> {
        match (self, output) {
            (UnitTable::GroupKey, serde_json::Value::String(key)) => Ok(key.clone()),
            (UnitTable::GroupKey, other) => Ok(other.to_string()),
            (UnitTable::Step, value) => to_json(value),
        }
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn to_priority(value: i64) -> Result<u8, RepositoryError> {
    u8::try_from(value).map_err(|_| RepositoryError::Query(format!("priority out of range: {value}")))
}

fn row_to_workflow_run(row: &SqliteRow) -> Result<WorkflowRun, RepositoryError> {
    Ok(WorkflowRun {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        workflow_id: parse_uuid(&col::<String>(row, "workflow_id")?)?,
        workflow_version_id: parse_uuid(&col::<String>(row, "workflow_version_id")?)?,
        workflow_name: col(row, "workflow_name")?,
        status: parse_enum(&col::<String>(row, "status")?)?,
        trigger: from_json(&col::<String>(row, "trigger_data")?, "trigger_data")?,
        input: from_json(&col::<String>(row, "input")?, "input")?,
        additional_metadata: from_json(&col::<String>(row, "additional_metadata")?, "additional_metadata")?,
        dedupe_value: col(row, "dedupe_value")?,
        priority: to_priority(col(row, "priority")?)?,
        concurrency_group_key: col(row, "concurrency_group_key")?,
        sticky_worker_id: parse_opt_uuid(col(row, "sticky_worker_id")?)?,
        error: col(row, "error")?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
        started_at: parse_opt_datetime(col(row, "started_at")?)?,
        finished_at: parse_opt_datetime(col(row, "finished_at")?)?,
        deleted_at: parse_opt_datetime(col(row, "deleted_at")?)?,
    })
}

fn row_to_job_run(row: &SqliteRow) -> Result<JobRun, RepositoryError> {
    Ok(JobRun {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        workflow_run_id: parse_uuid(&col::<String>(row, "workflow_run_id")?)?,
        job_name: col(row, "job_name")?,
        kind: parse_enum(&col::<String>(row, "kind")?)?,
        status: parse_enum(&col::<String>(row, "status")?)?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
        started_at: parse_opt_datetime(col(row, "started_at")?)?,
        finished_at: parse_opt_datetime(col(row, "finished_at")?)?,
    })
}

fn row_to_step_run(row: &SqliteRow) -> Result<StepRun, RepositoryError> {
    let output: Option<String> = col(row, "output")?;
    let timeout_secs: Option<i64> = col(row, "timeout_secs")?;
    Ok(StepRun {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        workflow_run_id: parse_uuid(&col::<String>(row, "workflow_run_id")?)?,
        job_run_id: parse_uuid(&col::<String>(row, "job_run_id")?)?,
        step_name: col(row, "step_name")?,
        action_id: col(row, "action_id")?,
        status: parse_enum(&col::<String>(row, "status")?)?,
        parent_ids: from_json(&col::<String>(row, "parent_ids")?, "parent_ids")?,
        input: from_json(&col::<String>(row, "input")?, "input")?,
        output: output.as_deref().map(|s| from_json(s, "output")).transpose()?,
        error: col(row, "error")?,
        priority: to_priority(col(row, "priority")?)?,
        retry_count: to_u32(col(row, "retry_count")?, "retry_count")?,
        max_retries: to_u32(col(row, "max_retries")?, "max_retries")?,
        requeue_count: to_u32(col(row, "requeue_count")?, "requeue_count")?,
        timeout_secs: timeout_secs.map(|s| s.max(0) as u64),
        schedule_timeout_at: parse_opt_datetime(col(row, "schedule_timeout_at")?)?,
        timeout_at: parse_opt_datetime(col(row, "timeout_at")?)?,
        requeue_after: parse_opt_datetime(col(row, "requeue_after")?)?,
        worker_id: parse_opt_uuid(col(row, "worker_id")?)?,
        dispatcher_id: parse_opt_uuid(col(row, "dispatcher_id")?)?,
        assigned_at: parse_opt_datetime(col(row, "assigned_at")?)?,
        slot_units: to_u32(col(row, "slot_units")?, "slot_units")?,
        rate_limits: from_json(&col::<String>(row, "rate_limits")?, "rate_limits")?,
        desired_labels: from_json(&col::<String>(row, "desired_labels")?, "desired_labels")?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
        started_at: parse_opt_datetime(col(row, "started_at")?)?,
        finished_at: parse_opt_datetime(col(row, "finished_at")?)?,
    })
}

fn row_to_group_key_run(row: &SqliteRow) -> Result<GetGroupKeyRun, RepositoryError> {
    Ok(GetGroupKeyRun {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        workflow_run_id: parse_uuid(&col::<String>(row, "workflow_run_id")?)?,
        action_id: col(row, "action_id")?,
        status: parse_enum(&col::<String>(row, "status")?)?,
        input: from_json(&col::<String>(row, "input")?, "input")?,
        output: col(row, "output")?,
        error: col(row, "error")?,
        requeue_count: to_u32(col(row, "requeue_count")?, "requeue_count")?,
        schedule_timeout_at: parse_opt_datetime(col(row, "schedule_timeout_at")?)?,
        worker_id: parse_opt_uuid(col(row, "worker_id")?)?,
        dispatcher_id: parse_opt_uuid(col(row, "dispatcher_id")?)?,
        assigned_at: parse_opt_datetime(col(row, "assigned_at")?)?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
        started_at: parse_opt_datetime(col(row, "started_at")?)?,
        finished_at: parse_opt_datetime(col(row, "finished_at")?)?,
    })
}

fn row_to_unit_ref(row: &SqliteRow) -> Result<UnitRef, RepositoryError> {
    Ok(UnitRef {
        kind: parse_enum(&col::<String>(row, "kind")?)?,
        id: parse_uuid(&col::<String>(row, "id")?)?,
        workflow_run_id: parse_uuid(&col::<String>(row, "workflow_run_id")?)?,
        status: parse_enum(&col::<String>(row, "status")?)?,
        requeue_count: to_u32(col(row, "requeue_count")?, "requeue_count")?,
        worker_id: parse_opt_uuid(col(row, "worker_id")?)?,
    })
}

// ---------------------------------------------------------------------------
// Inserts
// ---------------------------------------------------------------------------

async fn insert_workflow_run(conn: &mut SqliteConnection, run: &WorkflowRun) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO workflow_runs (
               id, workflow_id, workflow_version_id, workflow_name, status, trigger_kind,
               trigger_data, input, additional_metadata, dedupe_value, priority,
               concurrency_group_key, sticky_worker_id, error, created_at, started_at,
               finished_at, deleted_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(run.id.to_string())
    .bind(run.workflow_id.to_string())
    .bind(run.workflow_version_id.to_string())
    .bind(&run.workflow_name)
    .bind(enum_name(&run.status)?)
    .bind(enum_name(&run.trigger.kind())?)
    .bind(to_json(&run.trigger)?)
    .bind(to_json(&run.input)?)
    .bind(to_json(&run.additional_metadata)?)
    .bind(&run.dedupe_value)
    .bind(i64::from(run.priority))
    .bind(&run.concurrency_group_key)
    .bind(run.sticky_worker_id.map(|id| id.to_string()))
    .bind(&run.error)
    .bind(format_datetime(&run.created_at))
    .bind(format_opt_datetime(run.started_at.as_ref()))
    .bind(format_opt_datetime(run.finished_at.as_ref()))
    .bind(format_opt_datetime(run.deleted_at.as_ref()))
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_job_run(conn: &mut SqliteConnection, job: &JobRun) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO job_runs (id, workflow_run_id, job_name, kind, status, created_at, started_at, finished_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(job.id.to_string())
    .bind(job.workflow_run_id.to_string())
    .bind(&job.job_name)
    .bind(enum_name(&job.kind)?)
    .bind(enum_name(&job.status)?)
    .bind(format_datetime(&job.created_at))
    .bind(format_opt_datetime(job.started_at.as_ref()))
    .bind(format_opt_datetime(job.finished_at.as_ref()))
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_step_run(
    conn: &mut SqliteConnection,
    step: &StepRun,
    position: i64,
) -> Result<(), RepositoryError> {
    let output = step.output.as_ref().map(to_json).transpose()?;
    sqlx::query(
        r#"INSERT INTO step_runs (
               id, workflow_run_id, job_run_id, step_name, action_id, status, position,
               parent_ids, input, output, error, priority, retry_count, max_retries,
               requeue_count, timeout_secs, schedule_timeout_at, timeout_at, requeue_after,
               worker_id, dispatcher_id, assigned_at, slot_units, rate_limits, desired_labels,
               created_at, started_at, finished_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(step.id.to_string())
    .bind(step.workflow_run_id.to_string())
    .bind(step.job_run_id.to_string())
    .bind(&step.step_name)
    .bind(&step.action_id)
    .bind(enum_name(&step.status)?)
    .bind(position)
    .bind(to_json(&step.parent_ids)?)
    .bind(to_json(&step.input)?)
    .bind(output)
    .bind(&step.error)
    .bind(i64::from(step.priority))
    .bind(i64::from(step.retry_count))
    .bind(i64::from(step.max_retries))
    .bind(i64::from(step.requeue_count))
    .bind(step.timeout_secs.map(|s| s as i64))
    .bind(format_opt_datetime(step.schedule_timeout_at.as_ref()))
    .bind(format_opt_datetime(step.timeout_at.as_ref()))
    .bind(format_opt_datetime(step.requeue_after.as_ref()))
    .bind(step.worker_id.map(|id| id.to_string()))
    .bind(step.dispatcher_id.map(|id| id.to_string()))
    .bind(format_opt_datetime(step.assigned_at.as_ref()))
    .bind(i64::from(step.slot_units))
    .bind(to_json(&step.rate_limits)?)
    .bind(to_json(&step.desired_labels)?)
    .bind(format_datetime(&step.created_at))
    .bind(format_opt_datetime(step.started_at.as_ref()))
    .bind(format_opt_datetime(step.finished_at.as_ref()))
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

async fn insert_group_key_run(conn: &mut SqliteConnection, run: &GetGroupKeyRun) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO group_key_runs (
               id, workflow_run_id, action_id, status, input, output, error, requeue_count,
               schedule_timeout_at, worker_id, dispatcher_id, assigned_at, created_at,
               started_at, finished_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(run.id.to_string())
    .bind(run.workflow_run_id.to_string())
    .bind(&run.action_id)
    .bind(enum_name(&run.status)?)
    .bind(to_json(&run.input)?)
    .bind(&run.output)
    .bind(&run.error)
    .bind(i64::from(run.requeue_count))
    .bind(format_opt_datetime(run.schedule_timeout_at.as_ref()))
    .bind(run.worker_id.map(|id| id.to_string()))
    .bind(run.dispatcher_id.map(|id| id.to_string()))
    .bind(format_opt_datetime(run.assigned_at.as_ref()))
    .bind(format_datetime(&run.created_at))
    .bind(format_opt_datetime(run.started_at.as_ref()))
    .bind(format_opt_datetime(run.finished_at.as_ref()))
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

/// A guarded single-row write inside an admission plan must move exactly one row.
fn expect_moved(rows: u64, id: &Uuid, action: &str) -> Result<(), RepositoryError> {
    if rows == 1 {
        Ok(())
    } else {
        Err(RepositoryError::Conflict(format!("workflow run {id} could not be {action}")))
    }
}

// ---------------------------------------------------------------------------
// Shared transitions
// ---------------------------------------------------------------------------

impl SqliteRunRepository {
    /// Guarded update of a step or group-key run. Releases the unit's slot in
    /// the same transaction when the new status does not hold one.
    async fn transition_unit(
        &self,
        table: UnitTable,
        id: &Uuid,
        from: &[StepRunStatus],
        update: &UnitUpdate,
    ) -> Result<Option<SqliteRow>, RepositoryError> {
        let sources = enum_names(from)?;
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE ");
        qb.push(table.name());
        qb.push(" SET status = ").push_bind(enum_name(&update.status)?);
        if let Some(output) = &update.output {
            qb.push(", output = ").push_bind(table.encode_output(output)?);
        }
        if let Some(error) = &update.error {
            qb.push(", error = ").push_bind(error.clone());
        }
        if update.clear_assignment {
            qb.push(", worker_id = NULL, dispatcher_id = NULL, assigned_at = NULL");
            if table == UnitTable::Step && update.timeout_at.is_none() {
                qb.push(", timeout_at = NULL");
            }
        }
        if let Some(at) = &update.schedule_timeout_at {
            qb.push(", schedule_timeout_at = ").push_bind(format_datetime(at));
        }
        if let (UnitTable::Step, Some(at)) = (table, &update.timeout_at) {
            qb.push(", timeout_at = ").push_bind(format_datetime(at));
        }
        if let Some(at) = &update.requeue_after {
            qb.push(", requeue_after = ").push_bind(format_datetime(at));
        }
        if let Some(at) = &update.started_at {
            qb.push(", started_at = ").push_bind(format_datetime(at));
        }
        if let Some(at) = &update.finished_at {
            qb.push(", finished_at = ").push_bind(format_datetime(at));
        }
        if update.increment_retry && table == UnitTable::Step {
            qb.push(", retry_count = retry_count + 1");
        }
        if update.increment_requeue {
            qb.push(", requeue_count = requeue_count + 1");
        }
        qb.push(" WHERE id = ").push_bind(id.to_string());
        qb.push(" AND");
        push_in(&mut qb, "status", &sources);
        if let Some(worker_id) = update.expected_worker {
            qb.push(" AND worker_id = ").push_bind(worker_id.to_string());
        }
        qb.push(" RETURNING *");

        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        let row = qb.build().fetch_optional(&mut *tx).await.map_err(db_err)?;
        if row.is_some() && !update.status.holds_slot() {
            sqlx::query("DELETE FROM worker_slots WHERE unit_id = ?")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(row)
    }

    async fn list_unit_refs(&self, sql: &str, at: String, limit: u32) -> Result<Vec<UnitRef>, RepositoryError> {
        let rows = sqlx::query(sql)
            .bind(&at)
            .bind(&at)
            .bind(i64::from(limit))
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_unit_ref).collect()
    }
}

const UNITS_PAST_SCHEDULE_TIMEOUT: &str = r#"
    SELECT 'step_run' AS kind, id, workflow_run_id, status, requeue_count, worker_id
    FROM step_runs
    WHERE status = 'pending_assignment' AND schedule_timeout_at IS NOT NULL AND schedule_timeout_at < ?
    UNION ALL
    SELECT 'group_key_run' AS kind, id, workflow_run_id, status, requeue_count, worker_id
    FROM group_key_runs
    WHERE status = 'pending_assignment' AND schedule_timeout_at IS NOT NULL AND schedule_timeout_at < ?
    LIMIT ?"#;

const UNITS_PAST_ACK_DEADLINE: &str = r#"
    SELECT 'step_run' AS kind, id, workflow_run_id, status, requeue_count, worker_id
    FROM step_runs
    WHERE status = 'assigned' AND assigned_at < ?
    UNION ALL
    SELECT 'group_key_run' AS kind, id, workflow_run_id, status, requeue_count, worker_id
    FROM group_key_runs
    WHERE status = 'assigned' AND assigned_at < ?
    LIMIT ?"#;

const UNITS_ON_LOST_WORKERS: &str = r#"
    SELECT 'step_run' AS kind, id, workflow_run_id, status, requeue_count, worker_id
    FROM step_runs
    WHERE status IN ('assigned', 'running')
      AND worker_id IN (SELECT id FROM workers WHERE is_active = 0 OR last_heartbeat_at < ?)
    UNION ALL
    SELECT 'group_key_run' AS kind, id, workflow_run_id, status, requeue_count, worker_id
    FROM group_key_runs
    WHERE status IN ('assigned', 'running')
      AND worker_id IN (SELECT id FROM workers WHERE is_active = 0 OR last_heartbeat_at < ?)
    LIMIT ?"#;

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_workflow_run(&self, new_run: &NewWorkflowRun) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        insert_workflow_run(&mut tx, &new_run.run).await?;
        for job in &new_run.jobs {
            insert_job_run(&mut tx, job).await?;
        }
        for (position, step) in new_run.steps.iter().enumerate() {
            insert_step_run(&mut tx, step, position as i64).await?;
        }
        if let Some(group_key_run) = &new_run.group_key_run {
            insert_group_key_run(&mut tx, group_key_run).await?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn get_workflow_run(&self, id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_workflow_run).transpose()
    }

    async fn list_workflow_runs(&self, filter: &WorkflowRunFilter) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let statuses = enum_names(&filter.statuses)?;
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM workflow_runs WHERE 1 = 1");
        if let Some(workflow_id) = filter.workflow_id {
            qb.push(" AND workflow_id = ").push_bind(workflow_id.to_string());
        }
        if !statuses.is_empty() {
            qb.push(" AND");
            push_in(&mut qb, "status", &statuses);
        }
        if let Some(key) = &filter.group_key {
            qb.push(" AND concurrency_group_key = ").push_bind(key.clone());
        }
        if !filter.include_deleted {
            qb.push(" AND deleted_at IS NULL");
        }
        qb.push(match filter.order {
            SortOrder::Asc => " ORDER BY created_at ASC, id ASC",
            SortOrder::Desc => " ORDER BY created_at DESC, id DESC",
        });
        if filter.limit > 0 {
            qb.push(" LIMIT ").push_bind(i64::from(filter.limit));
        } else if filter.offset > 0 {
            qb.push(" LIMIT -1");
        }
        if filter.offset > 0 {
            qb.push(" OFFSET ").push_bind(i64::from(filter.offset));
        }

        let rows = qb.build().fetch_all(&self.pool.reader).await.map_err(db_err)?;
        rows.iter().map(row_to_workflow_run).collect()
    }

    async fn transition_workflow_run(
        &self,
        id: &Uuid,
        from: &[WorkflowRunStatus],
        update: &WorkflowRunUpdate,
    ) -> Result<Option<WorkflowRun>, RepositoryError> {
        let sources = enum_names(from)?;
        let at = format_datetime(&update.at);
        let started = (update.status == WorkflowRunStatus::Running).then(|| at.clone());
        let finished = update.status.is_terminal().then(|| at.clone());

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE workflow_runs SET status = ");
        qb.push_bind(enum_name(&update.status)?);
        qb.push(", error = COALESCE(").push_bind(update.error.clone()).push(", error)");
        qb.push(", started_at = COALESCE(started_at, ").push_bind(started).push(")");
        qb.push(", finished_at = COALESCE(").push_bind(finished).push(", finished_at)");
        qb.push(" WHERE id = ").push_bind(id.to_string());
        qb.push(" AND");
        push_in(&mut qb, "status", &sources);
        qb.push(" RETURNING *");

        let row = qb.build().fetch_optional(&self.pool.writer).await.map_err(db_err)?;
        row.as_ref().map(row_to_workflow_run).transpose()
    }

    async fn set_concurrency_group_key(&self, id: &Uuid, key: &str) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET concurrency_group_key = ?
             WHERE id = ? AND status = 'pending' AND concurrency_group_key IS NULL",
        )
        .bind(key)
        .bind(id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn apply_admission(&self, plan: &AdmissionPlan) -> Result<(), RepositoryError> {
        let at = format_datetime(&plan.at);
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        for id in &plan.cancel {
            let result = sqlx::query(
                "UPDATE workflow_runs SET status = 'cancelled', error = ?, finished_at = ?
                 WHERE id = ? AND status = 'running'",
            )
            .bind(CANCELLED_BY_NEWER_RUN)
            .bind(&at)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            expect_moved(result.rows_affected(), id, "cancelled")?;
        }
        for id in &plan.drop {
            let result = sqlx::query(
                "UPDATE workflow_runs SET status = 'cancelled', error = ?, finished_at = ?
                 WHERE id = ? AND status = 'pending'",
            )
            .bind(DROPPED_AT_LIMIT)
            .bind(&at)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            expect_moved(result.rows_affected(), id, "dropped")?;
        }
        for id in &plan.queue {
            let result = sqlx::query("UPDATE workflow_runs SET status = 'queued' WHERE id = ? AND status = 'pending'")
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            expect_moved(result.rows_affected(), id, "queued")?;
        }
        for id in &plan.start {
            let result = sqlx::query(
                "UPDATE workflow_runs SET status = 'running', started_at = COALESCE(started_at, ?)
                 WHERE id = ? AND status IN ('pending', 'queued')",
            )
            .bind(&at)
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            expect_moved(result.rows_affected(), id, "started")?;
        }

        if !plan.start.is_empty() {
            let running: i64 = match &plan.scope {
                AdmissionScope::Group { workflow_id, key } => sqlx::query_scalar(
                    "SELECT COUNT(*) FROM workflow_runs
                     WHERE workflow_id = ? AND concurrency_group_key = ? AND status = 'running'",
                )
                .bind(workflow_id.to_string())
                .bind(key)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?,
                AdmissionScope::Workflow { workflow_id } => sqlx::query_scalar(
                    "SELECT COUNT(*) FROM workflow_runs WHERE workflow_id = ? AND status = 'running'",
                )
                .bind(workflow_id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?,
            };
            if running > i64::from(plan.max_runs) {
                return Err(RepositoryError::Conflict(format!(
                    "admission would leave {running} runs running with a limit of {}",
                    plan.max_runs
                )));
            }
        }

        tx.commit().await.map_err(db_err)
    }

    async fn soft_expire_workflow_runs(
        &self,
        finished_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET deleted_at = ?
             WHERE deleted_at IS NULL
               AND status IN ('succeeded', 'failed', 'cancelled')
               AND finished_at IS NOT NULL AND finished_at < ?",
        )
        .bind(format_datetime(&at))
        .bind(format_datetime(&finished_before))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn get_job_run(&self, id: &Uuid) -> Result<Option<JobRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM job_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_job_run).transpose()
    }

    async fn list_job_runs(&self, workflow_run_id: &Uuid) -> Result<Vec<JobRun>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM job_runs WHERE workflow_run_id = ? ORDER BY created_at, id")
            .bind(workflow_run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_job_run).collect()
    }

    async fn transition_job_run(
        &self,
        id: &Uuid,
        from: &[JobRunStatus],
        to: JobRunStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<JobRun>, RepositoryError> {
        let sources = enum_names(from)?;
        let at = format_datetime(&at);
        let started = (to == JobRunStatus::Running).then(|| at.clone());
        let finished = to.is_terminal().then(|| at.clone());

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE job_runs SET status = ");
        qb.push_bind(enum_name(&to)?);
        qb.push(", started_at = COALESCE(started_at, ").push_bind(started).push(")");
        qb.push(", finished_at = COALESCE(").push_bind(finished).push(", finished_at)");
        qb.push(" WHERE id = ").push_bind(id.to_string());
        qb.push(" AND");
        push_in(&mut qb, "status", &sources);
        qb.push(" RETURNING *");

        let row = qb.build().fetch_optional(&self.pool.writer).await.map_err(db_err)?;
        row.as_ref().map(row_to_job_run).transpose()
    }

    async fn get_step_run(&self, id: &Uuid) -> Result<Option<StepRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM step_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_step_run).transpose()
    }

    async fn list_step_runs_for_job(&self, job_run_id: &Uuid) -> Result<Vec<StepRun>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM step_runs WHERE job_run_id = ? ORDER BY position")
            .bind(job_run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_step_run).collect()
    }

    async fn list_step_runs_for_workflow_run(&self, workflow_run_id: &Uuid) -> Result<Vec<StepRun>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM step_runs WHERE workflow_run_id = ? ORDER BY position")
            .bind(workflow_run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_step_run).collect()
    }

    async fn transition_step_run(
        &self,
        id: &Uuid,
        from: &[StepRunStatus],
        update: &UnitUpdate,
    ) -> Result<Option<StepRun>, RepositoryError> {
        let row = self.transition_unit(UnitTable::Step, id, from, update).await?;
        row.as_ref().map(row_to_step_run).transpose()
    }

    async fn cancel_step_runs(
        &self,
        ids: &[Uuid],
        from: &[StepRunStatus],
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let targets: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let sources = enum_names(from)?;

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE step_runs SET status = 'cancelled', error = ");
        qb.push_bind(reason.to_string());
        qb.push(", finished_at = ").push_bind(format_datetime(&at));
        qb.push(" WHERE");
        push_in(&mut qb, "id", &targets);
        qb.push(" AND");
        push_in(&mut qb, "status", &sources);
        qb.push(" RETURNING id");

        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        let moved: Vec<String> = qb.build_query_scalar().fetch_all(&mut *tx).await.map_err(db_err)?;
        if !moved.is_empty() {
            let mut release = QueryBuilder::<Sqlite>::new("DELETE FROM worker_slots WHERE");
            push_in(&mut release, "unit_id", &moved);
            release.build().execute(&mut *tx).await.map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        moved.iter().map(|id| parse_uuid(id)).collect()
    }

    async fn list_assignable_step_runs(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<StepRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM step_runs
             WHERE status = 'pending_assignment' AND (requeue_after IS NULL OR requeue_after <= ?)
             ORDER BY priority DESC, created_at ASC, position ASC
             LIMIT ?",
        )
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_step_run).collect()
    }

    async fn list_step_runs_past_execution_timeout(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<UnitRef>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT 'step_run' AS kind, id, workflow_run_id, status, requeue_count, worker_id
             FROM step_runs
             WHERE status = 'running' AND timeout_at IS NOT NULL AND timeout_at < ?
             ORDER BY timeout_at
             LIMIT ?",
        )
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_unit_ref).collect()
    }

    async fn reset_for_replay(&self, reset: &ReplayReset) -> Result<(), RepositoryError> {
        let targets: Vec<String> = reset.step_run_ids.iter().map(Uuid::to_string).collect();
        let terminal = enum_names(&StepRunStatus::TERMINAL)?;
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        let mut check = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM step_runs WHERE");
        push_in(&mut check, "id", &targets);
        check.push(" AND");
        push_in(&mut check, "status", &terminal);
        let final_count: i64 = check.build_query_scalar().fetch_one(&mut *tx).await.map_err(db_err)?;
        if final_count != targets.len() as i64 {
            return Err(RepositoryError::Conflict(format!(
                "step run {} or one of its descendants is no longer final",
                reset.target_id
            )));
        }

        let mut clear = QueryBuilder::<Sqlite>::new(
            "UPDATE step_runs SET status = 'pending', output = NULL, error = NULL, worker_id = NULL,
             dispatcher_id = NULL, assigned_at = NULL, schedule_timeout_at = NULL, timeout_at = NULL,
             requeue_after = NULL, started_at = NULL, finished_at = NULL, retry_count = 0,
             requeue_count = 0 WHERE",
        );
        push_in(&mut clear, "id", &targets);
        clear.build().execute(&mut *tx).await.map_err(db_err)?;

        if let Some(input) = &reset.input {
            sqlx::query("UPDATE step_runs SET input = ? WHERE id = ?")
                .bind(to_json(input)?)
                .bind(reset.target_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        let mut release = QueryBuilder::<Sqlite>::new("DELETE FROM worker_slots WHERE");
        push_in(&mut release, "unit_id", &targets);
        release.build().execute(&mut *tx).await.map_err(db_err)?;

        sqlx::query("UPDATE job_runs SET status = 'running', finished_at = NULL WHERE id = ?")
            .bind(reset.job_run_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            "UPDATE workflow_runs SET status = 'running', error = NULL, finished_at = NULL,
             started_at = COALESCE(started_at, ?) WHERE id = ?",
        )
        .bind(format_datetime(&reset.at))
        .bind(reset.workflow_run_id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)
    }

    async fn get_group_key_run(&self, id: &Uuid) -> Result<Option<GetGroupKeyRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM group_key_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_group_key_run).transpose()
    }

    async fn get_group_key_run_for_workflow_run(
        &self,
        workflow_run_id: &Uuid,
    ) -> Result<Option<GetGroupKeyRun>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM group_key_runs WHERE workflow_run_id = ?")
            .bind(workflow_run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_group_key_run).transpose()
    }

    async fn transition_group_key_run(
        &self,
        id: &Uuid,
        from: &[StepRunStatus],
        update: &UnitUpdate,
    ) -> Result<Option<GetGroupKeyRun>, RepositoryError> {
        let row = self.transition_unit(UnitTable::GroupKey, id, from, update).await?;
        row.as_ref().map(row_to_group_key_run).transpose()
    }

    async fn list_assignable_group_key_runs(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<GetGroupKeyRun>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM group_key_runs
             WHERE status = 'pending_assignment' AND (requeue_after IS NULL OR requeue_after <= ?)
             ORDER BY created_at, id
             LIMIT ?",
        )
        .bind(format_datetime(&now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_group_key_run).collect()
    }

    async fn list_units_past_schedule_timeout(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<UnitRef>, RepositoryError> {
        self.list_unit_refs(UNITS_PAST_SCHEDULE_TIMEOUT, format_datetime(&now), limit)
            .await
    }

    async fn list_units_past_ack_deadline(
        &self,
        assigned_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<UnitRef>, RepositoryError> {
        self.list_unit_refs(UNITS_PAST_ACK_DEADLINE, format_datetime(&assigned_before), limit)
            .await
    }

    async fn list_units_on_lost_workers(
        &self,
        heartbeat_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<UnitRef>, RepositoryError> {
        self.list_unit_refs(UNITS_ON_LOST_WORKERS, format_datetime(&heartbeat_before), limit)
            .await
    }

    async fn assign_unit(&self, request: &SlotRequest) -> Result<AssignOutcome, RepositoryError> {
        let table = UnitTable::for_kind(request.kind);
        let unit_id = request.unit_id.to_string();
        let worker_id = request.worker_id.to_string();
        let at = format_datetime(&request.at);
        let status_sql = format!("SELECT status FROM {} WHERE id = ?", table.name());
        let assign_sql = format!(
            "UPDATE {} SET status = 'assigned', worker_id = ?, dispatcher_id = ?, assigned_at = ?
             WHERE id = ? AND status = 'pending_assignment'",
            table.name()
        );

        // Dropping `tx` on an early return rolls every write back.
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        let status: Option<String> = sqlx::query_scalar(&status_sql)
            .bind(&unit_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let pending = enum_name(&StepRunStatus::PendingAssignment)?;
        if status.as_deref() != Some(pending.as_str()) {
            return Ok(AssignOutcome::NotPendingAssignment);
        }

        let capacity: Option<(i64, bool)> =
            sqlx::query_as("SELECT max_runs, is_active FROM workers WHERE id = ?")
                .bind(&worker_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        let Some((max_runs, true)) = capacity else {
            return Ok(AssignOutcome::InsufficientSlots);
        };
        let used: i64 = sqlx::query_scalar("SELECT COALESCE(SUM(units), 0) FROM worker_slots WHERE worker_id = ?")
            .bind(&worker_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        if max_runs - used < i64::from(request.units) {
            return Ok(AssignOutcome::InsufficientSlots);
        }

        for (key, units) in &request.rate_limits {
            let row = sqlx::query("SELECT * FROM rate_limits WHERE key = ?")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            let Some(row) = row else {
                tracing::debug!(%key, "step requests an undeclared rate limit, ignoring");
                continue;
            };
            let limit = row_to_rate_limit(&row)?;
            let available = limit.available_at(request.at);
            if available < *units {
                return Ok(AssignOutcome::RateLimited { key: key.clone() });
            }
            let refilled_at = if limit.window_elapsed(request.at) {
                request.at
            } else {
                limit.last_refill_at
            };
            sqlx::query("UPDATE rate_limits SET remaining = ?, last_refill_at = ? WHERE key = ?")
                .bind(i64::from(available - units))
                .bind(format_datetime(&refilled_at))
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        sqlx::query(
            "INSERT INTO worker_slots (unit_id, unit_kind, worker_id, units, acquired_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&unit_id)
        .bind(enum_name(&request.kind)?)
        .bind(&worker_id)
        .bind(i64::from(request.units))
        .bind(&at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let assigned = sqlx::query(&assign_sql)
            .bind(&worker_id)
            .bind(request.dispatcher_id.map(|id| id.to_string()))
            .bind(&at)
            .bind(&unit_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if assigned.rows_affected() != 1 {
            return Ok(AssignOutcome::NotPendingAssignment);
        }

        if request.pin_sticky {
            sqlx::query("UPDATE workflow_runs SET sticky_worker_id = ? WHERE id = ? AND sticky_worker_id IS NULL")
                .bind(&worker_id)
                .bind(request.workflow_run_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(AssignOutcome::Assigned)
    }

    async fn release_slot(&self, unit_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM worker_slots WHERE unit_id = ?")
            .bind(unit_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn slot_holder(&self, unit_id: &Uuid) -> Result<Option<(Uuid, u32)>, RepositoryError> {
        let row: Option<(String, i64)> = sqlx::query_as("SELECT worker_id, units FROM worker_slots WHERE unit_id = ?")
            .bind(unit_id.to_string())
            .fetch_optional(&self.pool.writer)
            .await
            .map_err(db_err)?;
        row.map(|(worker_id, units)| Ok((parse_uuid(&worker_id)?, to_u32(units, "units")?)))
            .transpose()
    }

    async fn create_event(&self, event: &Event) -> Result<(), RepositoryError> {
        sqlx::query("INSERT INTO events (id, key, data, additional_metadata, created_at) VALUES (?, ?, ?, ?, ?)")
            .bind(event.id.to_string())
            .bind(&event.key)
            .bind(to_json(&event.data)?)
            .bind(to_json(&event.additional_metadata)?)
            .bind(format_datetime(&event.created_at))
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
