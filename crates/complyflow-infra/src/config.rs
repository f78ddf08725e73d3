//! Engine configuration loader for ComplyFlow.
//!
//! Reads `config.toml` from the data directory (`~/.complyflow/` in
//! production) and deserializes it into [`EngineConfig`]. Falls back to
//! defaults when the file is missing, malformed or fails validation.

use std::path::{Path, PathBuf};

use complyflow_types::config::EngineConfig;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "COMPLYFLOW_DATA_DIR";

/// Errors from parsing or validating a configuration document.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Resolve the data directory.
///
/// Priority: `COMPLYFLOW_DATA_DIR`, then `~/.complyflow`, then `./.complyflow`
/// when no home directory is known.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".complyflow"))
        .unwrap_or_else(|| PathBuf::from(".complyflow"))
}

/// SQLite URL for the configured database file inside `data_dir`.
pub fn database_url(data_dir: &Path, config: &EngineConfig) -> String {
    format!(
        "sqlite://{}?mode=rwc",
        data_dir.join(&config.storage.database_file).display()
    )
}

/// Parse and validate a configuration document.
pub fn parse_engine_config(content: &str) -> Result<EngineConfig, ConfigError> {
    let config: EngineConfig = toml::from_str(content)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    let limits = &config.engine;
    if limits.execution_timeout_secs == 0 || limits.task_timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "engine timeouts must be greater than zero".to_string(),
        ));
    }
    if limits.max_transitions == 0 {
        return Err(ConfigError::Invalid(
            "engine.max_transitions must be greater than zero".to_string(),
        ));
    }
    if limits.default_list_limit == 0 || limits.default_list_limit > limits.max_list_limit {
        return Err(ConfigError::Invalid(format!(
            "engine.default_list_limit must be between 1 and max_list_limit ({})",
            limits.max_list_limit
        )));
    }
    if config.circuit_breaker.failure_threshold == 0 {
        return Err(ConfigError::Invalid(
            "circuit_breaker.failure_threshold must be at least 1".to_string(),
        ));
    }
    if config.storage.database_file.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "storage.database_file must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse or validate, logs a warning and
///   returns the default.
/// - Otherwise returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match parse_engine_config(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to load {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}
