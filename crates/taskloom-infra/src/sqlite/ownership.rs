//! SQLite coordinator and timer repository.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use taskloom_core::repository::OwnershipRepository;
use taskloom_types::error::RepositoryError;
use taskloom_types::ownership::{Coordinator, OwnerKind, TimerSchedule, WorkflowTimer};
use uuid::Uuid;

use super::codec::{
    col, db_err, enum_name, format_datetime, format_opt_datetime, from_json, parse_datetime, parse_enum,
    parse_opt_datetime, parse_opt_uuid, parse_uuid, to_json,
};
use super::pool::DatabasePool;

#[derive(Clone)]
pub struct SqliteOwnershipRepository {
    pool: DatabasePool,
}

impl SqliteOwnershipRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn row_to_coordinator(row: &SqliteRow) -> Result<Coordinator, RepositoryError> {
    Ok(Coordinator {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        kind: parse_enum(&col::<String>(row, "kind")?)?,
        is_active: col(row, "is_active")?,
        last_heartbeat_at: parse_datetime(&col::<String>(row, "last_heartbeat_at")?)?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
    })
}

fn row_to_timer(row: &SqliteRow) -> Result<WorkflowTimer, RepositoryError> {
    Ok(WorkflowTimer {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        workflow_id: parse_uuid(&col::<String>(row, "workflow_id")?)?,
        workflow_version_id: parse_uuid(&col::<String>(row, "workflow_version_id")?)?,
        schedule: from_json(&col::<String>(row, "schedule")?, "schedule")?,
        input: from_json(&col::<String>(row, "input")?, "input")?,
        ticker_id: parse_opt_uuid(col(row, "ticker_id")?)?,
        last_fired_at: parse_opt_datetime(col(row, "last_fired_at")?)?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
    })
}

fn timer_kind(schedule: &TimerSchedule) -> &'static str {
    match schedule {
        TimerSchedule::Cron { .. } => "cron",
        TimerSchedule::Once { .. } => "once",
    }
}

async fn insert_timer(conn: &mut sqlx::SqliteConnection, timer: &WorkflowTimer) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"INSERT INTO workflow_timers (id, workflow_id, workflow_version_id, kind, schedule, input, ticker_id, last_fired_at, created_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
    )
    .bind(timer.id.to_string())
    .bind(timer.workflow_id.to_string())
    .bind(timer.workflow_version_id.to_string())
    .bind(timer_kind(&timer.schedule))
    .bind(to_json(&timer.schedule)?)
    .bind(to_json(&timer.input)?)
    .bind(timer.ticker_id.map(|id| id.to_string()))
    .bind(format_opt_datetime(timer.last_fired_at.as_ref()))
    .bind(format_datetime(&timer.created_at))
    .execute(conn)
    .await
    .map_err(db_err)?;
    Ok(())
}

impl OwnershipRepository for SqliteOwnershipRepository {
    async fn upsert_coordinator(&self, coordinator: &Coordinator) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO coordinators (id, kind, is_active, last_heartbeat_at, created_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   is_active = excluded.is_active,
                   last_heartbeat_at = excluded.last_heartbeat_at"#,
        )
        .bind(coordinator.id.to_string())
        .bind(enum_name(&coordinator.kind)?)
        .bind(coordinator.is_active)
        .bind(format_datetime(&coordinator.last_heartbeat_at))
        .bind(format_datetime(&coordinator.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn heartbeat_coordinator(
        &self,
        kind: OwnerKind,
        id: &Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE coordinators SET last_heartbeat_at = ?, is_active = 1 WHERE id = ? AND kind = ?",
        )
        .bind(format_datetime(&at))
        .bind(id.to_string())
        .bind(enum_name(&kind)?)
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_coordinators(&self, kind: OwnerKind) -> Result<Vec<Coordinator>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM coordinators WHERE kind = ? AND is_active = 1 ORDER BY created_at, id")
            .bind(enum_name(&kind)?)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_coordinator).collect()
    }

    async fn transfer_ownership(&self, kind: OwnerKind, from: &Uuid, to: &Uuid) -> Result<u64, RepositoryError> {
        let from = from.to_string();
        let to = to.to_string();
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;

        // Only the coordinator that deactivates `from` moves its holdings.
        let deactivated = sqlx::query("UPDATE coordinators SET is_active = 0 WHERE id = ? AND kind = ? AND is_active = 1")
            .bind(&from)
            .bind(enum_name(&kind)?)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if deactivated.rows_affected() == 0 {
            return Ok(0);
        }

        let mut moved = 0;
        match kind {
            OwnerKind::Dispatcher => {
                moved += sqlx::query("UPDATE workers SET dispatcher_id = ? WHERE dispatcher_id = ?")
                    .bind(&to)
                    .bind(&from)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .rows_affected();
                for table in ["step_runs", "group_key_runs"] {
                    let sql = format!(
                        "UPDATE {table} SET dispatcher_id = ?
                         WHERE dispatcher_id = ? AND status IN ('assigned', 'running')"
                    );
                    moved += sqlx::query(&sql)
                        .bind(&to)
                        .bind(&from)
                        .execute(&mut *tx)
                        .await
                        .map_err(db_err)?
                        .rows_affected();
                }
            }
            OwnerKind::Ticker => {
                moved += sqlx::query("UPDATE workflow_timers SET ticker_id = ? WHERE ticker_id = ?")
                    .bind(&to)
                    .bind(&from)
                    .execute(&mut *tx)
                    .await
                    .map_err(db_err)?
                    .rows_affected();
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(moved)
    }

    async fn create_timer(&self, timer: &WorkflowTimer) -> Result<(), RepositoryError> {
        let mut conn = self.pool.writer.acquire().await.map_err(db_err)?;
        insert_timer(&mut conn, timer).await
    }

    async fn replace_cron_timers(&self, workflow_id: &Uuid, timers: &[WorkflowTimer]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.writer.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM workflow_timers WHERE workflow_id = ? AND kind = 'cron'")
            .bind(workflow_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for timer in timers {
            insert_timer(&mut tx, timer).await?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn claim_unowned_timers(&self, ticker_id: &Uuid, limit: u32) -> Result<u64, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_timers SET ticker_id = ?
             WHERE id IN (SELECT id FROM workflow_timers WHERE ticker_id IS NULL ORDER BY created_at LIMIT ?)",
        )
        .bind(ticker_id.to_string())
        .bind(i64::from(limit))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn list_timers_for_ticker(&self, ticker_id: &Uuid) -> Result<Vec<WorkflowTimer>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM workflow_timers WHERE ticker_id = ? ORDER BY created_at, id")
            .bind(ticker_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_timer).collect()
    }

    async fn record_cron_fire(
        &self,
        timer_id: &Uuid,
        expected: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_timers SET last_fired_at = ?
             WHERE id = ? AND kind = 'cron' AND last_fired_at IS ?",
        )
        .bind(format_datetime(&fired_at))
        .bind(timer_id.to_string())
        .bind(format_opt_datetime(expected.as_ref()))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn consume_schedule_timer(&self, timer_id: &Uuid) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM workflow_timers WHERE id = ? AND kind = 'once'")
            .bind(timer_id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::sqlite::test_support::{seed_workflow, test_pool};

    fn cron_timer(workflow_id: Uuid, version_id: Uuid) -> WorkflowTimer {
        WorkflowTimer {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_version_id: version_id,
            schedule: TimerSchedule::Cron {
                expression: "*/5 * * * *".to_string(),
            },
            input: serde_json::json!({}),
            ticker_id: None,
            last_fired_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_coordinator_heartbeat_and_listing() {
        let repo = SqliteOwnershipRepository::new(test_pool().await);
        let now = Utc::now();
        let dispatcher = Coordinator::new(OwnerKind::Dispatcher, now);
        let ticker = Coordinator::new(OwnerKind::Ticker, now);
        repo.upsert_coordinator(&dispatcher).await.unwrap();
        repo.upsert_coordinator(&ticker).await.unwrap();

        assert!(repo
            .heartbeat_coordinator(OwnerKind::Dispatcher, &dispatcher.id, now)
            .await
            .unwrap());
        assert!(!repo
            .heartbeat_coordinator(OwnerKind::Ticker, &dispatcher.id, now)
            .await
            .unwrap());

        let dispatchers = repo.list_coordinators(OwnerKind::Dispatcher).await.unwrap();
        assert_eq!(dispatchers.len(), 1);
        assert_eq!(dispatchers[0].id, dispatcher.id);
    }

    #[tokio::test]
    async fn test_ticker_transfer_moves_timers_once() {
        let pool = test_pool().await;
        let fixture = seed_workflow(&pool, None).await;
        let repo = SqliteOwnershipRepository::new(pool);
        let now = Utc::now();
        let stale = Coordinator::new(OwnerKind::Ticker, now - Duration::seconds(300));
        let live = Coordinator::new(OwnerKind::Ticker, now);
        repo.upsert_coordinator(&stale).await.unwrap();
        repo.upsert_coordinator(&live).await.unwrap();

        repo.create_timer(&cron_timer(fixture.workflow_id, fixture.version_id))
            .await
            .unwrap();
        assert_eq!(repo.claim_unowned_timers(&stale.id, 10).await.unwrap(), 1);
        assert_eq!(repo.claim_unowned_timers(&live.id, 10).await.unwrap(), 0);

        assert_eq!(
            repo.transfer_ownership(OwnerKind::Ticker, &stale.id, &live.id).await.unwrap(),
            1
        );
        assert_eq!(
            repo.transfer_ownership(OwnerKind::Ticker, &stale.id, &live.id).await.unwrap(),
            0
        );
        assert_eq!(repo.list_timers_for_ticker(&live.id).await.unwrap().len(), 1);
        assert_eq!(repo.list_coordinators(OwnerKind::Ticker).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cron_fire_is_claimed_once() {
        let pool = test_pool().await;
        let fixture = seed_workflow(&pool, None).await;
        let repo = SqliteOwnershipRepository::new(pool);
        let timer = cron_timer(fixture.workflow_id, fixture.version_id);
        repo.create_timer(&timer).await.unwrap();

        let fired_at = Utc::now();
        assert!(repo.record_cron_fire(&timer.id, None, fired_at).await.unwrap());
        assert!(!repo.record_cron_fire(&timer.id, None, fired_at).await.unwrap());
        assert!(repo
            .record_cron_fire(&timer.id, Some(fired_at), fired_at + Duration::minutes(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_replace_cron_keeps_scheduled_timers() {
        let pool = test_pool().await;
        let fixture = seed_workflow(&pool, None).await;
        let repo = SqliteOwnershipRepository::new(pool);
        let ticker = Uuid::now_v7();

        let once = WorkflowTimer {
            schedule: TimerSchedule::Once {
                trigger_at: Utc::now() + Duration::hours(1),
            },
            ticker_id: Some(ticker),
            ..cron_timer(fixture.workflow_id, fixture.version_id)
        };
        repo.create_timer(&once).await.unwrap();
        let mut old_cron = cron_timer(fixture.workflow_id, fixture.version_id);
        old_cron.ticker_id = Some(ticker);
        repo.create_timer(&old_cron).await.unwrap();

        let mut new_cron = cron_timer(fixture.workflow_id, fixture.version_id);
        new_cron.ticker_id = Some(ticker);
        repo.replace_cron_timers(&fixture.workflow_id, &[new_cron.clone()])
            .await
            .unwrap();

        let ids: Vec<Uuid> = repo
            .list_timers_for_ticker(&ticker)
            .await
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&once.id));
        assert!(ids.contains(&new_cron.id));

        assert!(repo.consume_schedule_timer(&once.id).await.unwrap());
        assert!(!repo.consume_schedule_timer(&once.id).await.unwrap());
        assert!(!repo.consume_schedule_timer(&new_cron.id).await.unwrap());
    }
}
