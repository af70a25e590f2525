//! Concurrency admission, worker slot allocation and worker registration.

pub mod admission;
pub mod allocator;
pub mod workers;

pub use admission::{Admission, AdmissionOutcome};
pub use allocator::{Assignment, AssignmentReport, Placement, rank_workers};
pub use workers::WorkerRegistration;
