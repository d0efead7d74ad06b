//! # tap-metrics
//!
//! Metrics for ollama-tap.
//!
//! This crate provides:
//! - The process-wide Prometheus registry, constructed once and passed to
//!   every component that records observations
//! - Queue accounting shared by admission control and the sampler
//! - The periodic system sampler and its platform providers
//! - The `/metrics` and `/health` HTTP endpoint

pub mod common;
pub mod endpoint;
pub mod queue;
pub mod registry;
pub mod system;

pub use common::{
    EndpointMetrics, GenerationMetrics, LatencyBucket, ProxyMetrics, QueueMetrics,
    RequestMetrics, SystemMetrics, TokenPhase,
};
pub use endpoint::{HealthInfo, MetricsEndpoint};
pub use queue::{QueueDepth, QueueGauges, QueueSnapshot, QueueState};
pub use registry::{MetricsRegistry, MetricsRegistryBuilder};
pub use system::{
    default_provider, NullProvider, PowermetricsProvider, ResourceSample, SysinfoProvider,
    SystemMetricsProvider, SystemSampler, ThermalPressure,
};

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Sampler error: {0}")]
    Sampler(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
