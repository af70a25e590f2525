//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (taskloom-infra) implements. The core crate never depends on any
//! specific storage technology.
//!
//! Every mutation of shared state is a conditional write: the store applies
//! it only if the row is still in an allowed status and reports whether it
//! did. Two coordinators racing for the same transition get one winner.

pub mod ownership;
pub mod run;
pub mod worker;
pub mod workflow;

pub use ownership::OwnershipRepository;
pub use run::RunRepository;
pub use worker::WorkerRepository;
pub use workflow::WorkflowRepository;

/// Sort order for list queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first. Admission reads use this for FIFO order.
    Asc,
    #[default]
    Desc,
}

/// The full set of repositories the engine runs against.
///
/// Implemented once per storage backend so engine services take a single
/// type parameter.
pub trait Store: Clone + Send + Sync + 'static {
    type Workflows: WorkflowRepository;
    type Runs: RunRepository;
    type Workers: WorkerRepository;
    type Ownership: OwnershipRepository;

    fn workflows(&self) -> &Self::Workflows;
    fn runs(&self) -> &Self::Runs;
    fn workers(&self) -> &Self::Workers;
    fn ownership(&self) -> &Self::Ownership;
}
