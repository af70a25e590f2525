//! The SQLite-backed [`Store`] bundle handed to the engine.

use taskloom_core::repository::Store;

use super::ownership::SqliteOwnershipRepository;
use super::pool::DatabasePool;
use super::run::SqliteRunRepository;
use super::worker::SqliteWorkerRepository;
use super::workflow::SqliteWorkflowRepository;

/// Every repository over one shared pool.
#[derive(Clone)]
pub struct SqliteStore {
    workflows: SqliteWorkflowRepository,
    runs: SqliteRunRepository,
    workers: SqliteWorkerRepository,
    ownership: SqliteOwnershipRepository,
}

impl SqliteStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self {
            workflows: SqliteWorkflowRepository::new(pool.clone()),
            runs: SqliteRunRepository::new(pool.clone()),
            workers: SqliteWorkerRepository::new(pool.clone()),
            ownership: SqliteOwnershipRepository::new(pool),
        }
    }
}

impl Store for SqliteStore {
    type Workflows = SqliteWorkflowRepository;
    type Runs = SqliteRunRepository;
    type Workers = SqliteWorkerRepository;
    type Ownership = SqliteOwnershipRepository;

    fn workflows(&self) -> &Self::Workflows {
        &self.workflows
    }

    fn runs(&self) -> &Self::Runs {
        &self.runs
    }

    fn workers(&self) -> &Self::Workers {
        &self.workers
    }

    fn ownership(&self) -> &Self::Ownership {
        &self.ownership
    }
}
