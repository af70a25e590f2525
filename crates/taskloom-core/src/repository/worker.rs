//! Worker and rate-limit repository trait definition.

use chrono::{DateTime, Utc};
use taskloom_types::error::RepositoryError;
use taskloom_types::worker::{RateLimit, Worker, WorkerCapacity};
use uuid::Uuid;

/// Repository trait for worker registration, liveness and rate-limit budgets.
pub trait WorkerRepository: Send + Sync {
    /// Insert or replace a worker and its declared actions.
    fn upsert_worker(
        &self,
        worker: &Worker,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_worker(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkerCapacity>, RepositoryError>> + Send;

    /// Record a heartbeat. Returns `false` if the worker is unknown.
    fn heartbeat_worker(
        &self,
        id: &Uuid,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn set_worker_active(
        &self,
        id: &Uuid,
        active: bool,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// All workers with their held slot units, ordered by id.
    fn list_workers(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkerCapacity>, RepositoryError>> + Send;

    /// Active workers declaring `action` whose heartbeat is at or after
    /// `heartbeat_after`, with their held slot units.
    fn list_candidates(
        &self,
        action: &str,
        heartbeat_after: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<WorkerCapacity>, RepositoryError>> + Send;

    fn upsert_rate_limit(
        &self,
        limit: &RateLimit,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_rate_limit(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<RateLimit>, RepositoryError>> + Send;
}
