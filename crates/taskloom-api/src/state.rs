//! Application state wiring the engine to its concrete store.
//!
//! The engine is generic over the store; AppState pins it to SQLite and
//! carries the configuration and data directory every command needs.

use std::path::PathBuf;
use std::sync::Arc;

use taskloom_core::Engine;
use taskloom_infra::crypto::hash::Sha256ContentHasher;
use taskloom_infra::sqlite::pool::database_url;
use taskloom_infra::sqlite::{DatabasePool, SqliteStore};
use taskloom_types::config::EngineConfig;

pub type ConcreteEngine = Engine<SqliteStore>;

/// Shared application state used by every CLI command.
#[derive(Clone)]
pub struct AppState {
    pub engine: ConcreteEngine,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Connect to `{data_dir}/taskloom.db` (creating and migrating it) and
    /// build the engine.
    pub async fn init(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;

        let db_pool = DatabasePool::new(&database_url(&data_dir)).await?;
        let engine = Engine::new(
            SqliteStore::new(db_pool),
            config,
            Arc::new(Sha256ContentHasher::new()),
        );

        Ok(Self { engine, data_dir })
    }
}
