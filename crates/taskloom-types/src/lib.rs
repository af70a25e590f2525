//! Shared domain types for taskloom.
//!
//! Runs and their status machines, workers and labels, workflow declarations,
//! coordinator ownership, engine events and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror, schemars.

pub mod config;
pub mod error;
pub mod event;
pub mod ownership;
pub mod run;
pub mod worker;
pub mod workflow;
