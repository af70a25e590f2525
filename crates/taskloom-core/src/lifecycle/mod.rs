//! Lifecycle state machine for workflow, job, step and group-key runs.
//!
//! `transition` holds the pure rules. The other modules apply them to the
//! store: read the current state, decide, then write with a guard on the
//! state that was read. A guard miss means another coordinator got there
//! first and is reported as a conflict, never as a crash.

pub mod group_key;
pub mod job_run;
pub mod step_run;
pub mod transition;
pub mod workflow_run;

pub use step_run::{StepOutcome, StepTransition};
