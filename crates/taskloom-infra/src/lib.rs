//! Infrastructure layer for Taskloom.
//!
//! Contains implementations of the ports defined in `taskloom-core`: the
//! SQLite store, SHA-256 content hashing for workflow checksums, the
//! JSON-lines analytics sink and the `config.toml` loader.

pub mod analytics_sink;
pub mod config;
pub mod crypto;
pub mod sqlite;

#[cfg(test)]
mod scenarios;
