//! Configuration management for ollama-tap
//!
//! Configuration is layered from several sources. From highest to lowest
//! precedence: command line overrides applied by the binary, `OLLAMA_TAP_*`
//! environment variables, a YAML file, and the built-in defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an explicit configuration file
pub const CONFIG_PATH_ENV: &str = "OLLAMA_TAP_CONFIG";

/// Prefix for environment overrides, e.g. `OLLAMA_TAP_PROXY__PORT=9000`
pub const ENV_PREFIX: &str = "OLLAMA_TAP";

/// Largest accepted `max_concurrency`, the permit limit of the admission
/// semaphore
pub const MAX_CONCURRENCY: usize = usize::MAX >> 3;

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["./ollama-tap.yaml", "/etc/ollama-tap/config.yaml"];

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Primary inference server
    pub upstream: UpstreamConfig,

    /// Optional secondary backend selected per request by header
    pub secondary: SecondaryConfig,

    /// Proxy listener and admission settings
    pub proxy: ProxyConfig,

    /// Metrics and health listener
    pub metrics: MetricsConfig,

    /// Background resource sampling
    pub sampler: SamplerConfig,

    /// Log output
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default sources.
    ///
    /// The file named by `OLLAMA_TAP_CONFIG` is used when set, otherwise the
    /// common locations are probed.
    pub fn load() -> Result<Self> {
        Self::load_with(None)
    }

    /// Load configuration, optionally from an explicit file, with environment
    /// overrides applied on top.
    pub fn load_with(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        } else if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            for location in DEFAULT_CONFIG_LOCATIONS {
                builder = builder.add_source(config::File::with_name(location).required(false));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Load configuration from a specific file layered over the defaults
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path));

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;

        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.upstream.validate()?;
        self.secondary.validate()?;
        self.proxy.validate()?;
        self.sampler.validate()?;
        self.logging.validate()?;

        if let Some(metrics_port) = self.metrics.port {
            if metrics_port == 0 {
                return Err(Error::config("Metrics port must be greater than 0"));
            }
            if metrics_port == self.proxy.port {
                return Err(Error::config(
                    "Proxy and metrics ports must be different; unset the metrics port to serve metrics on the proxy listener",
                ));
            }
        }

        Ok(())
    }

    /// Socket address of the proxy listener
    pub fn proxy_bind_addr(&self) -> Result<SocketAddr> {
        parse_bind_addr(&self.proxy.bind_address, self.proxy.port)
    }

    /// Socket address of the dedicated metrics listener, if one is configured
    pub fn metrics_bind_addr(&self) -> Option<Result<SocketAddr>> {
        self.metrics
            .port
            .map(|port| parse_bind_addr(&self.metrics.bind_address, port))
    }

    /// Public URL of the proxy listener
    pub fn proxy_url(&self) -> String {
        format!("http://{}:{}", self.proxy.bind_address, self.proxy.port)
    }

    /// Public URL of the metrics endpoint
    pub fn metrics_url(&self) -> String {
        match self.metrics.port {
            Some(port) => format!("http://{}:{}/metrics", self.metrics.bind_address, port),
            None => format!("{}/metrics", self.proxy_url()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            secondary: SecondaryConfig::default(),
            proxy: ProxyConfig::default(),
            metrics: MetricsConfig::default(),
            sampler: SamplerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn parse_bind_addr(host: &str, port: u16) -> Result<SocketAddr> {
    let host = if host == "localhost" { "127.0.0.1" } else { host };
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| Error::config(format!("Invalid bind address {}:{}: {}", host, port, e)))
}

/// Primary inference server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Display name reported in `/health`
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl UpstreamConfig {
    /// `host:port` authority used to build outbound URIs
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::config("Upstream host must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("Upstream port must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            name: "ollama".to_string(),
            host: "localhost".to_string(),
            port: 11434,
        }
    }
}

/// Secondary backend, addressed with the same wire protocol as the primary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecondaryConfig {
    pub enabled: bool,
    /// Value of the backend header that routes a request here
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl SecondaryConfig {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.host.is_empty() {
            return Err(Error::config("Secondary backend is enabled but has no host"));
        }
        if self.port == 0 {
            return Err(Error::config("Secondary backend port must be greater than 0"));
        }
        if self.name.is_empty() {
            return Err(Error::config("Secondary backend name must not be empty"));
        }
        Ok(())
    }
}

impl Default for SecondaryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: "secondary".to_string(),
            host: "localhost".to_string(),
            port: 8080,
        }
    }
}

/// Proxy listener and admission settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub bind_address: String,
    pub port: u16,

    /// Maximum number of requests executing against the backend at once
    pub max_concurrency: usize,

    /// Reject arrivals once this many requests are waiting. `None` keeps the
    /// queue unbounded.
    pub max_queue_size: Option<usize>,

    /// Total time allowed for one upstream call, including streaming
    pub request_timeout_seconds: u64,

    /// Maximum inbound request body size in bytes
    pub max_request_size: usize,

    /// Header whose value selects the secondary backend
    pub backend_header: String,
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::config("Proxy port must be greater than 0"));
        }
        if self.max_concurrency == 0 {
            return Err(Error::config("Max concurrency must be greater than 0"));
        }
        if self.max_concurrency > MAX_CONCURRENCY {
            return Err(Error::config(format!(
                "Max concurrency must be at most {}",
                MAX_CONCURRENCY
            )));
        }
        if self.max_queue_size == Some(0) {
            return Err(Error::config("Max queue size must be greater than 0 when set"));
        }
        if self.request_timeout_seconds == 0 {
            return Err(Error::config("Request timeout must be greater than 0"));
        }
        if self.max_request_size == 0 {
            return Err(Error::config("Max request size must be greater than 0"));
        }
        if self.backend_header.is_empty() {
            return Err(Error::config("Backend header name must not be empty"));
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 11435,
            max_concurrency: 4,
            max_queue_size: None,
            request_timeout_seconds: 300,
            max_request_size: 10 * 1024 * 1024, // 10MB
            backend_header: "x-ollama-tap-backend".to_string(),
        }
    }
}

/// Metrics and health listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub bind_address: String,

    /// Dedicated port. `None` serves `/metrics` and `/health` on the proxy
    /// listener instead.
    pub port: Option<u16>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: Some(8001),
        }
    }
}

/// Background resource sampling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub enabled: bool,
    pub interval_seconds: u64,

    /// Substring matched against process names to sum backend memory
    pub upstream_process_name: String,

    /// Publish platform heuristics (GPU residency, power, thermal pressure)
    pub estimate_platform_metrics: bool,
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.enabled && self.interval_seconds == 0 {
            return Err(Error::config("Sampler interval must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 10,
            upstream_process_name: "ollama".to_string(),
            estimate_platform_metrics: true,
        }
    }
}

/// Log output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    pub level: String,
    /// `text` or `json`
    pub format: String,
    pub show_target: bool,
    pub show_thread_ids: bool,
    pub show_line_numbers: bool,
}

impl LoggingConfig {
    fn validate(&self) -> Result<()> {
        if self.level.trim().is_empty() {
            return Err(Error::config("Log level must not be empty"));
        }
        match self.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(Error::config(format!(
                "Unknown log format '{}', expected 'text' or 'json'",
                other
            ))),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
        }
    }
}

/// Builder for [`Config`]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Start from an existing configuration
    pub fn from_config(config: Config) -> Self {
        Self { config }
    }

    /// Set the primary upstream address
    pub fn upstream(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.upstream.host = host.into();
        self.config.upstream.port = port;
        self
    }

    /// Enable the secondary backend at the given address
    pub fn secondary(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.secondary.enabled = true;
        self.config.secondary.host = host.into();
        self.config.secondary.port = port;
        self
    }

    /// Set the proxy bind address
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.config.proxy.bind_address = address.into();
        self
    }

    /// Set the proxy listen port
    pub fn proxy_port(mut self, port: u16) -> Self {
        self.config.proxy.port = port;
        self
    }

    /// Set the metrics port, or `None` to share the proxy listener
    pub fn metrics_port(mut self, port: Option<u16>) -> Self {
        self.config.metrics.port = port;
        self
    }

    /// Set the admission bound
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.config.proxy.max_concurrency = max;
        self
    }

    /// Set the optional queue-depth limit
    pub fn max_queue_size(mut self, max: Option<usize>) -> Self {
        self.config.proxy.max_queue_size = max;
        self
    }

    /// Set the total upstream call timeout, rounded up to whole seconds
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self.config.proxy.request_timeout_seconds = secs;
        self
    }

    /// Set the maximum inbound body size
    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.config.proxy.max_request_size = bytes;
        self
    }

    /// Enable or disable the background sampler
    pub fn sampler_enabled(mut self, enabled: bool) -> Self {
        self.config.sampler.enabled = enabled;
        self
    }

    /// Set the log filter directive
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Set the log format
    pub fn log_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    /// Build the configuration without validating it
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upstream.authority(), "localhost:11434");
        assert_eq!(config.proxy.port, 11435);
        assert_eq!(config.metrics.port, Some(8001));
        assert_eq!(config.proxy.max_concurrency, 4);
        assert_eq!(config.proxy.max_queue_size, None);
        assert_eq!(config.proxy.request_timeout(), Duration::from_secs(300));
        assert!(!config.secondary.enabled);
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .upstream("10.0.0.5", 9000)
            .proxy_port(3000)
            .metrics_port(None)
            .max_concurrency(2)
            .max_queue_size(Some(8))
            .request_timeout(Duration::from_millis(1500))
            .secondary("10.0.0.6", 9001)
            .build();

        assert_eq!(config.upstream.authority(), "10.0.0.5:9000");
        assert_eq!(config.proxy.port, 3000);
        assert!(config.metrics.port.is_none());
        assert_eq!(config.proxy.max_queue_size, Some(8));
        assert_eq!(config.proxy.request_timeout_seconds, 2);
        assert!(config.secondary.enabled);
        assert_eq!(config.secondary.authority(), "10.0.0.6:9001");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.proxy.port = 8001;
        assert!(config.validate().is_err());

        config.metrics.port = None;
        assert!(config.validate().is_ok());

        config.proxy.max_concurrency = 0;
        assert!(config.validate().is_err());
        config.proxy.max_concurrency = MAX_CONCURRENCY;
        assert!(config.validate().is_ok());
        config.proxy.max_concurrency = MAX_CONCURRENCY + 1;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("at most"));
        config.proxy.max_concurrency = 1;

        config.proxy.request_timeout_seconds = 0;
        assert!(config.validate().is_err());
        config.proxy.request_timeout_seconds = 1;

        config.proxy.max_queue_size = Some(0);
        assert!(config.validate().is_err());
        config.proxy.max_queue_size = None;

        config.secondary.enabled = true;
        config.secondary.host.clear();
        assert!(config.validate().is_err());
        config.secondary.enabled = false;

        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_addresses() {
        let config = Config::default();
        let proxy = config.proxy_bind_addr().unwrap();
        assert_eq!(proxy.port(), 11435);

        let metrics = config.metrics_bind_addr().unwrap().unwrap();
        assert_eq!(metrics.port(), 8001);
        assert_eq!(config.metrics_url(), "http://127.0.0.1:8001/metrics");

        let shared = ConfigBuilder::new().metrics_port(None).build();
        assert!(shared.metrics_bind_addr().is_none());
        assert_eq!(shared.metrics_url(), "http://127.0.0.1:11435/metrics");

        let local = ConfigBuilder::new().bind_address("localhost").build();
        assert!(local.proxy_bind_addr().is_ok());

        let bad = ConfigBuilder::new().bind_address("not an address").build();
        assert!(bad.proxy_bind_addr().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "upstream:\n  host: gpu-box\n  port: 11500\nproxy:\n  max_concurrency: 8\n  max_queue_size: 32\nmetrics:\n  port: 9100\n"
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.upstream.host, "gpu-box");
        assert_eq!(config.upstream.port, 11500);
        assert_eq!(config.proxy.max_concurrency, 8);
        assert_eq!(config.proxy.max_queue_size, Some(32));
        assert_eq!(config.metrics.port, Some(9100));
        // Untouched sections keep their defaults
        assert_eq!(config.proxy.port, 11435);
        assert_eq!(config.sampler.interval_seconds, 10);
    }

    #[test]
    fn test_load_from_file_rejects_invalid() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "proxy:\n  port: 8001\n").unwrap();

        let err = Config::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_) | Error::Config(_)));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();

        let yaml = serde_yaml::to_string(&config).unwrap();
        let deserialized: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, deserialized);
    }
}
