//! Process-wide tracing setup.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::{LogFormat, LoggingConfig};

/// Builds the level filter: `RUST_LOG` wins over the configured level.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber and routes `log` records into it.
///
/// Calling this more than once is harmless; later calls keep the first setup.
pub fn init_tracing(config: &LoggingConfig) {
    let _ = tracing_log::LogTracer::init();

    let registry = Registry::default().with(env_filter(config));
    let result = match config.format {
        LogFormat::Plain => registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };

    if result.is_ok() {
        tracing::debug!(level = %config.level, format = ?config.format, "Tracing initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_filter_falls_back_to_config_level() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Plain,
        };
        assert_eq!(env_filter(&config).to_string(), "debug");
    }

    #[test]
    #[serial]
    fn test_env_filter_ignores_garbage_level() {
        std::env::remove_var("RUST_LOG");
        let config = LoggingConfig {
            level: "chatlog=loud".to_string(),
            format: LogFormat::Plain,
        };
        assert_eq!(env_filter(&config).to_string(), "info");
    }

    #[test]
    #[serial]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
