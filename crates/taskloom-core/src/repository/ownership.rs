//! Coordinator ownership and timer repository trait definition.
//!
//! The ownership table replaces in-process singletons: which dispatcher owns
//! a worker and which ticker owns a timer is a row, and handing a stale
//! owner's holdings to a peer is one transactional update.

use chrono::{DateTime, Utc};
use taskloom_types::error::RepositoryError;
use taskloom_types::ownership::{Coordinator, OwnerKind, WorkflowTimer};
use uuid::Uuid;

pub trait OwnershipRepository: Send + Sync {
    fn upsert_coordinator(
        &self,
        coordinator: &Coordinator,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn heartbeat_coordinator(
        &self,
        kind: OwnerKind,
        id: &Uuid,
        at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Active coordinators of one kind.
    fn list_coordinators(
        &self,
        kind: OwnerKind,
    ) -> impl std::future::Future<Output = Result<Vec<Coordinator>, RepositoryError>> + Send;

    /// Move everything `from` owns to `to` and deactivate `from`.
    ///
    /// Dispatchers own workers and the in-flight runs bound through them;
    /// tickers own timers. Returns the number of rows moved. Applied only
    /// while `from` is still active, so two scanners racing to hand off the
    /// same owner move its holdings once.
    fn transfer_ownership(
        &self,
        kind: OwnerKind,
        from: &Uuid,
        to: &Uuid,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    fn create_timer(
        &self,
        timer: &WorkflowTimer,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Replace every cron timer of a workflow with `timers` in one transaction.
    fn replace_cron_timers(
        &self,
        workflow_id: &Uuid,
        timers: &[WorkflowTimer],
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Assign up to `limit` ownerless timers to `ticker_id`.
    fn claim_unowned_timers(
        &self,
        ticker_id: &Uuid,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    fn list_timers_for_ticker(
        &self,
        ticker_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowTimer>, RepositoryError>> + Send;

    /// Compare-and-swap `last_fired_at` from `expected` to `fired_at`.
    /// Returns `true` if this caller won the occurrence.
    fn record_cron_fire(
        &self,
        timer_id: &Uuid,
        expected: Option<DateTime<Utc>>,
        fired_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Delete a one-shot timer. Returns `true` if this caller deleted it.
    fn consume_schedule_timer(
        &self,
        timer_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
