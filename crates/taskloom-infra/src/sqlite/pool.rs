//! SQLite connection pools.
//!
//! One writer connection and a small read-only pool, both in WAL mode. Every
//! guarded transition in the store runs on the writer, so its single
//! connection is what makes check-then-write sequences atomic within one
//! process. Across processes the busy timeout and SQLite's own write lock
//! take over.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

const DATABASE_FILE: &str = "taskloom.db";
const READER_CONNECTIONS: u32 = 8;
/// How long a writer waits on another process's write lock before failing
/// with a retryable busy error.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if needed) the database at `database_url` and apply
    /// pending migrations before any reader connects.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await?;
        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(READER_CONNECTIONS)
            .connect_with(options.read_only(true))
            .await?;

        tracing::debug!(url = database_url, "database pool ready");
        Ok(Self { reader, writer })
    }
}

pub fn database_url(data_dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join(DATABASE_FILE).display())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open() -> (tempfile::TempDir, DatabasePool) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url(dir.path())).await.unwrap();
        (dir, pool)
    }

    #[tokio::test]
    async fn test_migrations_create_engine_tables() {
        let (_dir, pool) = open().await;
        let tables: Vec<(String,)> = sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&pool.reader)
            .await
            .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();

        for expected in [
            "workflows",
            "workflow_versions",
            "workflow_runs",
            "job_runs",
            "step_runs",
            "group_key_runs",
            "workers",
            "worker_slots",
            "rate_limits",
            "coordinators",
            "workflow_timers",
            "events",
        ] {
            assert!(names.contains(&expected), "{expected} table missing");
        }
    }

    #[tokio::test]
    async fn test_writer_runs_wal_with_foreign_keys() {
        let (_dir, pool) = open().await;
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(&pool.writer).await.unwrap();
        let (fk,): (i32,) = sqlx::query_as("PRAGMA foreign_keys").fetch_one(&pool.writer).await.unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        assert_eq!(fk, 1);
    }

    #[tokio::test]
    async fn test_reader_cannot_write() {
        let (_dir, pool) = open().await;
        let result = sqlx::query("DELETE FROM workers").execute(&pool.reader).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_reopening_keeps_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let url = database_url(dir.path());
        {
            let pool = DatabasePool::new(&url).await.unwrap();
            sqlx::query("CREATE TABLE scratch (id INTEGER)").execute(&pool.writer).await.unwrap();
            sqlx::query("INSERT INTO scratch VALUES (7)").execute(&pool.writer).await.unwrap();
            pool.writer.close().await;
            pool.reader.close().await;
        }
        let pool = DatabasePool::new(&url).await.unwrap();
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM scratch").fetch_one(&pool.reader).await.unwrap();
        assert_eq!(id, 7);
    }

    #[test]
    fn test_database_url_points_into_data_dir() {
        let url = database_url(Path::new("/var/lib/taskloom"));
        assert_eq!(url, "sqlite:///var/lib/taskloom/taskloom.db?mode=rwc");
    }
}
