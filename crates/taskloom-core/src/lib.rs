//! Engine core for Taskloom, a durable workflow orchestration engine.
//!
//! This crate defines the repository traits (ports) the infrastructure
//! layer implements and the engine that drives runs through them. It
//! depends only on `taskloom-types` -- never on `taskloom-infra` or any
//! database crate.

pub mod analytics;
pub mod engine;
pub mod error;
pub mod event;
pub mod lifecycle;
pub mod recovery;
pub mod repository;
pub mod scheduling;
pub mod service;
pub mod store_retry;
pub mod workflow;

pub use engine::Engine;
pub use error::{EngineError, ErrorKind};
