//! Engine configuration loader.
//!
//! Reads `taskloom.toml` from a config directory and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::Path;

use taskloom_types::config::EngineConfig;

/// Name of the config file inside the config directory.
pub const CONFIG_FILE: &str = "taskloom.toml";

/// Load engine configuration from `{dir}/taskloom.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
pub async fn load_engine_config(dir: &Path) -> EngineConfig {
    let config_path = dir.join(CONFIG_FILE);

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
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}
