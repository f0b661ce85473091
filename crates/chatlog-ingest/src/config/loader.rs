use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::config::schema::{Config, LogFormat};
use crate::error::ConfigError;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "CHATLOG_";

const SUPPORTED_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Loads a JSON config file, applies `CHATLOG_*` overrides and validates the result.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut config: Config = serde_json::from_str(&content)?;
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Parses and validates a JSON config. Environment overrides are not applied.
pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

/// Built-in defaults plus environment overrides, for runs without a config file.
pub fn load_default_config() -> Result<Config, ConfigError> {
    let mut config = Config::default();
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Overwrites config values from `CHATLOG_*` variables.
///
/// Values that fail to parse are ignored with a warning.
pub fn apply_env_overrides(config: &mut Config) {
    if let Some(path) = env_path("DB_PATH") {
        config.database.path = path;
    }
    if let Some(path) = env_path("UPLOADS_DIR") {
        config.directories.uploads_dir = path;
    }
    if let Some(path) = env_path("EXTRACTED_DIR") {
        config.directories.extracted_dir = path;
    }
    if let Some(path) = env_path("MESSAGES_DIR") {
        config.directories.messages_dir = path;
    }
    if let Some(value) = env_parsed::<u64>("MAX_ARCHIVE_BYTES") {
        config.limits.max_archive_bytes = value;
    }
    if let Some(value) = env_parsed::<u64>("MAX_EXTRACTION_BYTES") {
        config.limits.max_extraction_bytes = value;
    }
    if let Some(value) = env_parsed::<u64>("MAX_ENTRY_COUNT") {
        config.limits.max_entry_count = value;
    }
    if let Some(level) = env_string("LOG_LEVEL") {
        config.logging.level = level.to_ascii_lowercase();
    }
    if let Some(format) = env_parsed::<LogFormat>("LOG_FORMAT") {
        config.logging.format = format;
    }
}

fn env_string(suffix: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, suffix))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn env_path(suffix: &str) -> Option<PathBuf> {
    env_string(suffix).map(PathBuf::from)
}

fn env_parsed<T: FromStr>(suffix: &str) -> Option<T> {
    let raw = env_string(suffix)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!(
                "Ignoring {}{}: cannot parse value '{}'",
                ENV_PREFIX,
                suffix,
                raw
            );
            None
        }
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    let limits = &config.limits;
    if limits.max_archive_bytes == 0 {
        return Err(invalid("limits.max_archive_bytes must be > 0"));
    }
    if limits.max_extraction_bytes == 0 {
        return Err(invalid("limits.max_extraction_bytes must be > 0"));
    }
    if limits.max_entry_count == 0 {
        return Err(invalid("limits.max_entry_count must be > 0"));
    }

    let batching = &config.batching;
    for (name, size) in [
        ("message_batch_size", batching.message_batch_size),
        ("thread_batch_size", batching.thread_batch_size),
        ("record_batch_size", batching.record_batch_size),
    ] {
        if size == 0 {
            return Err(invalid(format!("batching.{} must be > 0", name)));
        }
    }

    if config.retry.max_retries == 0 {
        return Err(invalid("retry.max_retries must be > 0"));
    }

    if config.worker_count == 0 {
        return Err(invalid("worker_count must be > 0"));
    }

    if !SUPPORTED_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(invalid(format!(
            "Unknown log level '{}'",
            config.logging.level
        )));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}
