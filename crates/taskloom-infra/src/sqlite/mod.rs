//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools. All writes go through the single writer
//! connection, which serializes the conditional updates the engine relies on.

mod codec;
pub mod ownership;
pub mod pool;
pub mod run;
pub mod store;
pub mod worker;
pub mod workflow;

#[cfg(test)]
pub(crate) mod test_support;

pub use pool::DatabasePool;
pub use store::SqliteStore;
