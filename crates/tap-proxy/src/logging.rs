//! Tracing subscriber setup

use crate::{ProxyError, Result};
use tap_core::LoggingConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ProxyError::Configuration(format!("Invalid log filter '{}': {}", config.level, e)))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_line_number(config.show_line_numbers);

    let installed = match config.format.as_str() {
        "json" => subscriber.json().try_init(),
        _ => subscriber.try_init(),
    };

    installed.map_err(|e| ProxyError::Configuration(format!("Failed to install logger: {}", e)))
}

/// Route logs through the test harness' captured output. Safe to call from
/// every test.
pub fn init_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tap_proxy=debug,tap_metrics=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_logging_is_idempotent() {
        init_test_logging();
        init_test_logging();
        tracing::debug!("logging initialised twice");
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "tap_proxy=notalevel".to_string(),
            ..Default::default()
        };
        assert!(matches!(init_logging(&config), Err(ProxyError::Configuration(_))));
    }
}
