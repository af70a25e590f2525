//! Workflow declarations and everything that turns them into runs.
//!
//! - `validate` -- structured validation of a declaration
//! - `dag` -- step ordering and descendant walks
//! - `checksum` -- backward-compatible declaration fingerprint
//! - `registry` -- versioned registration
//! - `expression` -- JEXL concurrency-key evaluation
//! - `schedule` -- cron normalization and next-occurrence math
//! - `trigger` -- creating runs from manual, event, timer and child triggers
//! - `replay` -- replay preflight and reset

pub mod checksum;
pub mod dag;
pub mod expression;
pub mod registry;
pub mod replay;
pub mod schedule;
pub mod trigger;
pub mod validate;

pub use registry::Registration;
pub use trigger::{TriggerRequest, WorkflowTarget};
