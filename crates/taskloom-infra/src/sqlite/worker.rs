//! SQLite worker and rate-limit repository.
//!
//! Slot usage is never stored on the worker row. It is summed from
//! `worker_slots` on every read, so capacity can only drift if a slot row
//! leaks, and slot rows are written in the same transactions as unit status.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use taskloom_core::repository::WorkerRepository;
use taskloom_types::error::RepositoryError;
use taskloom_types::worker::{RateLimit, Worker, WorkerCapacity};
use uuid::Uuid;

use super::codec::{col, db_err, format_datetime, from_json, parse_datetime, parse_opt_uuid, parse_uuid, to_json, to_u32};
use super::pool::DatabasePool;

const SELECT_WITH_USAGE: &str = r#"
    SELECT w.*,
           COALESCE((SELECT SUM(s.units) FROM worker_slots s WHERE s.worker_id = w.id), 0) AS used_slots
    FROM workers w"#;

#[derive(Clone)]
pub struct SqliteWorkerRepository {
    pool: DatabasePool,
}

impl SqliteWorkerRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

fn row_to_capacity(row: &SqliteRow) -> Result<WorkerCapacity, RepositoryError> {
    let worker = Worker {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        name: col(row, "name")?,
        dispatcher_id: parse_opt_uuid(col(row, "dispatcher_id")?)?,
        max_runs: to_u32(col(row, "max_runs")?, "max_runs")?,
        is_active: col(row, "is_active")?,
        last_heartbeat_at: parse_datetime(&col::<String>(row, "last_heartbeat_at")?)?,
        actions: from_json(&col::<String>(row, "actions")?, "actions")?,
        labels: from_json(&col::<String>(row, "labels")?, "labels")?,
        created_at: parse_datetime(&col::<String>(row, "created_at")?)?,
    };
    Ok(WorkerCapacity {
        worker,
        used_slots: to_u32(col(row, "used_slots")?, "used_slots")?,
    })
}

pub(crate) fn row_to_rate_limit(row: &SqliteRow) -> Result<RateLimit, RepositoryError> {
    let window_secs: i64 = col(row, "window_secs")?;
    Ok(RateLimit {
        key: col(row, "key")?,
        limit: col(row, "limit_value")?,
        window_secs: window_secs.max(0) as u64,
        remaining: col(row, "remaining")?,
        last_refill_at: parse_datetime(&col::<String>(row, "last_refill_at")?)?,
    })
}

impl WorkerRepository for SqliteWorkerRepository {
    async fn upsert_worker(&self, worker: &Worker) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO workers (id, name, dispatcher_id, max_runs, is_active, last_heartbeat_at, actions, labels, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   dispatcher_id = excluded.dispatcher_id,
                   max_runs = excluded.max_runs,
                   is_active = excluded.is_active,
                   last_heartbeat_at = excluded.last_heartbeat_at,
                   actions = excluded.actions,
                   labels = excluded.labels"#,
        )
        .bind(worker.id.to_string())
        .bind(&worker.name)
        .bind(worker.dispatcher_id.map(|id| id.to_string()))
        .bind(i64::from(worker.max_runs))
        .bind(worker.is_active)
        .bind(format_datetime(&worker.last_heartbeat_at))
        .bind(to_json(&worker.actions)?)
        .bind(to_json(&worker.labels)?)
        .bind(format_datetime(&worker.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_worker(&self, id: &Uuid) -> Result<Option<WorkerCapacity>, RepositoryError> {
        let sql = format!("{SELECT_WITH_USAGE} WHERE w.id = ?");
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_capacity).transpose()
    }

    async fn heartbeat_worker(&self, id: &Uuid, at: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE workers SET last_heartbeat_at = ?, is_active = 1 WHERE id = ?")
            .bind(format_datetime(&at))
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_worker_active(&self, id: &Uuid, active: bool) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE workers SET is_active = ? WHERE id = ?")
            .bind(active)
            .bind(id.to_string())
            .execute(&self.pool.writer)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_workers(&self) -> Result<Vec<WorkerCapacity>, RepositoryError> {
        let sql = format!("{SELECT_WITH_USAGE} ORDER BY w.created_at, w.id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_capacity).collect()
    }

    async fn list_candidates(
        &self,
        action: &str,
        heartbeat_after: DateTime<Utc>,
    ) -> Result<Vec<WorkerCapacity>, RepositoryError> {
        let sql = format!(
            "{SELECT_WITH_USAGE}
             WHERE w.is_active = 1
               AND w.last_heartbeat_at >= ?
               AND EXISTS (SELECT 1 FROM json_each(w.actions) WHERE json_each.value = ?)
             ORDER BY w.id"
        );
        let rows = sqlx::query(&sql)
            .bind(format_datetime(&heartbeat_after))
            .bind(action)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_capacity).collect()
    }

    async fn upsert_rate_limit(&self, limit: &RateLimit) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO rate_limits (key, limit_value, window_secs, remaining, last_refill_at)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(key) DO UPDATE SET
                   limit_value = excluded.limit_value,
                   window_secs = excluded.window_secs,
                   remaining = MIN(rate_limits.remaining, excluded.limit_value)"#,
        )
        .bind(&limit.key)
        .bind(limit.limit)
        .bind(limit.window_secs as i64)
        .bind(limit.remaining)
        .bind(format_datetime(&limit.last_refill_at))
        .execute(&self.pool.writer)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_rate_limit(&self, key: &str) -> Result<Option<RateLimit>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM rate_limits WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_rate_limit).transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Duration;
    use taskloom_types::worker::LabelValue;

    use super::*;
    use crate::sqlite::test_support::test_pool;

    fn worker(actions: &[&str], heartbeat: DateTime<Utc>) -> Worker {
        Worker {
            id: Uuid::now_v7(),
            name: "worker".to_string(),
            dispatcher_id: None,
            max_runs: 4,
            is_active: true,
            last_heartbeat_at: heartbeat,
            actions: actions.iter().map(|a| a.to_string()).collect(),
            labels: BTreeMap::from([("gpu".to_string(), LabelValue::Int(2))]),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_read_worker() {
        let repo = SqliteWorkerRepository::new(test_pool().await);
        let mut w = worker(&["email:send"], Utc::now());
        repo.upsert_worker(&w).await.unwrap();

        w.max_runs = 8;
        repo.upsert_worker(&w).await.unwrap();

        let found = repo.get_worker(&w.id).await.unwrap().unwrap();
        assert_eq!(found.worker.max_runs, 8);
        assert_eq!(found.used_slots, 0);
        assert_eq!(found.worker.labels.get("gpu"), Some(&LabelValue::Int(2)));
        assert_eq!(repo.list_workers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_candidates_filter_by_action_and_liveness() {
        let repo = SqliteWorkerRepository::new(test_pool().await);
        let now = Utc::now();
        let live = worker(&["email:send", "sms:send"], now);
        let stale = worker(&["email:send"], now - Duration::seconds(120));
        let other = worker(&["sms:send"], now);
        for w in [&live, &stale, &other] {
            repo.upsert_worker(w).await.unwrap();
        }

        let candidates = repo
            .list_candidates("email:send", now - Duration::seconds(30))
            .await
            .unwrap();
        let ids: Vec<Uuid> = candidates.iter().map(|c| c.worker.id).collect();
        assert_eq!(ids, vec![live.id]);

        repo.set_worker_active(&live.id, false).await.unwrap();
        assert!(repo
            .list_candidates("email:send", now - Duration::seconds(30))
            .await
            .unwrap()
            .is_empty());

        assert!(repo.heartbeat_worker(&live.id, Utc::now()).await.unwrap());
        assert!(!repo.heartbeat_worker(&Uuid::now_v7(), Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_rate_limit_redeclare_keeps_consumption() {
        let repo = SqliteWorkerRepository::new(test_pool().await);
        let now = Utc::now();
        let mut limit = RateLimit::new("api", 10, 60, now);
        limit.remaining = 3;
        repo.upsert_rate_limit(&limit).await.unwrap();

        repo.upsert_rate_limit(&RateLimit::new("api", 20, 60, now)).await.unwrap();
        let stored = repo.get_rate_limit("api").await.unwrap().unwrap();
        assert_eq!(stored.limit, 20);
        assert_eq!(stored.remaining, 3);
        assert!(repo.get_rate_limit("missing").await.unwrap().is_none());
    }
}
