//! Engine configuration loader.
//!
//! Reads `stagewright.toml` from the data directory (`~/.stagewright/` by
//! default) into [`EngineConfig`]. Falls back to defaults when the file is
//! missing or malformed.

use std::path::{Path, PathBuf};

use stagewright_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "STAGEWRIGHT_DATA_DIR";

/// Config file name inside the data directory.
pub const CONFIG_FILE: &str = "stagewright.toml";

/// Resolve the data directory: `STAGEWRIGHT_DATA_DIR`, else `~/.stagewright`.
pub fn resolve_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stagewright")
}

/// Load engine configuration from `{data_dir}/stagewright.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
/// - Otherwise the parsed config, clamped to usable values.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => clamp(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Raise values that would stall the engine to their minimums.
fn clamp(mut config: EngineConfig) -> EngineConfig {
    if config.max_parallelism == 0 {
        tracing::warn!("max_parallelism = 0 is not usable, clamping to 1");
        config.max_parallelism = 1;
    }
    if config.retry.max_attempts == 0 {
        tracing::warn!("retry.max_attempts = 0 is not usable, clamping to 1");
        config.retry.max_attempts = 1;
    }
    if config.retry.max_backoff_ms < config.retry.initial_backoff_ms {
        config.retry.max_backoff_ms = config.retry.initial_backoff_ms;
    }
    config.step_timeout_secs = config.step_timeout_secs.max(1);
    config.batch_timeout_secs = config.batch_timeout_secs.max(1);
    config
}
