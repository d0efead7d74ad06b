//! # tap-core
//!
//! Shared building blocks for ollama-tap, a monitoring reverse proxy that sits
//! in front of a local LLM inference server.
//!
//! This crate provides:
//!
//! - The configuration schema with file, environment and builder loading
//! - The unified error type used by configuration and startup code
//! - Per-request bookkeeping types shared by the proxy and metrics crates

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    Config, ConfigBuilder, LoggingConfig, MetricsConfig, ProxyConfig, SamplerConfig,
    SecondaryConfig, UpstreamConfig, MAX_CONCURRENCY,
};
pub use error::{Error, Result};
pub use types::{InFlightRequest, Routing, UNKNOWN_MODEL};
