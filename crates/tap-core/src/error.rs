//! Error handling for ollama-tap
//!
//! Configuration and startup failures share this type. Request-path failures
//! live in the proxy crate, which maps them onto HTTP responses.

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for configuration and startup
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Semantically invalid configuration
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// Errors raised while layering configuration sources
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = Error::config("ports collide");
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(err.to_string(), "Configuration error: ports collide");

        let layered = Error::from(config::ConfigError::NotFound("proxy.port".to_string()));
        assert!(layered.to_string().starts_with("Config error:"));
    }
}
