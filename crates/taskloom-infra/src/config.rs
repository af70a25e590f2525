//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.taskloom/` unless
//! `TASKLOOM_DATA_DIR` is set) and deserializes it into [`EngineConfig`].
//! The binary falls back to defaults when the file is missing or malformed;
//! `loom config check` uses [`read_engine_config`] to surface the problem.

use std::path::{Path, PathBuf};

use taskloom_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "TASKLOOM_DATA_DIR";

const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// The directory holding `config.toml` and `taskloom.db`.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taskloom")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Strictly read `{data_dir}/config.toml`. A missing file is the default
/// configuration; unreadable or malformed files are errors.
pub async fn read_engine_config(data_dir: &Path) -> Result<EngineConfig, ConfigError> {
    let path = config_path(data_dir);
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", path.display());
            return Ok(EngineConfig::default());
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };
    toml::from_str(&content).map_err(|source| ConfigError::Parse { path, source })
}

/// Load `{data_dir}/config.toml`, falling back to defaults on any failure.
///
/// The error is handed back rather than logged so the caller can report it
/// after the subscriber built from this very config is installed.
pub async fn load_engine_config(data_dir: &Path) -> (EngineConfig, Option<ConfigError>) {
    match read_engine_config(data_dir).await {
        Ok(config) => (config, None),
        Err(err) => (EngineConfig::default(), Some(err)),
    }
}
