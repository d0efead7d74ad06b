//! # tap-proxy
//!
//! Monitoring reverse proxy for a locally hosted inference server.
//!
//! This crate provides:
//! - Transparent forwarding of single-shot and streamed responses
//! - Bounded admission with observable queueing
//! - Best-effort extraction of token, latency and throughput metrics from
//!   response payloads, without altering what the client receives
//! - The proxy and metrics listeners and their lifecycle
//!
//! ## Example
//!
//! ```rust,no_run
//! use tap_core::Config;
//! use tap_proxy::MonitoringProxy;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let proxy = MonitoringProxy::new(Config::default())?;
//!     proxy.serve().await?;
//!     Ok(())
//! }
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub mod admission;
pub mod classifier;
pub mod handler;
pub mod logging;
pub mod observer;
pub mod proxy;
pub mod server;
pub mod service;

pub use admission::{AdmissionController, AdmissionPermit};
pub use classifier::{classify, endpoint_label};
pub use handler::{proxy_handler, ProxyState};
pub use observer::{GenerationStats, ResponseObserver, StreamObserver, StreamSummary, StreamingExtractionState};
pub use proxy::{Backend, OutboundBody, UpstreamClient};
pub use server::ProxyServer;
pub use service::{BoundAddrs, MonitoringProxy};

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while serving proxied requests
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Upstream did not answer within {0:?}")]
    UpstreamTimeout(Duration),

    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Response body could not be parsed for metrics. Never surfaced to clients.
    #[error("Malformed upstream response: {0}")]
    MalformedUpstreamResponse(String),

    /// A streamed record could not be parsed for metrics. Never surfaced to clients.
    #[error("Unparseable stream chunk: {0}")]
    ChunkParseError(String),

    #[error("Failed to bind {addr}: {source}")]
    StartupBindFailure {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Admission queue is full ({limit} waiting)")]
    QueueFull { limit: usize },

    #[error("Request body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("Invalid request body: {0}")]
    RequestBody(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Config error: {0}")]
    Core(#[from] tap_core::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] tap_metrics::MetricsError),

    #[error("HTTP error: {0}")]
    Http(#[from] axum::http::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Convert to HTTP status code
    pub fn to_status_code(&self) -> u16 {
        match self {
            ProxyError::UpstreamTimeout(_) => 504,
            ProxyError::UpstreamUnreachable(_) => 502,
            ProxyError::MalformedUpstreamResponse(_) => 502,
            ProxyError::ChunkParseError(_) => 502,
            ProxyError::StartupBindFailure { .. } => 500,
            ProxyError::QueueFull { .. } => 503,
            ProxyError::PayloadTooLarge { .. } => 413,
            ProxyError::RequestBody(_) => 400,
            ProxyError::Proxy(_) => 502,
            ProxyError::Configuration(_) => 500,
            ProxyError::Core(_) => 500,
            ProxyError::Metrics(_) => 500,
            ProxyError::Http(_) => 502,
            ProxyError::Io(_) => 500,
        }
    }

    /// Value of the `error_type` label recorded for this error
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::UpstreamTimeout(_) => "UpstreamTimeout",
            ProxyError::UpstreamUnreachable(_) => "UpstreamUnreachable",
            ProxyError::MalformedUpstreamResponse(_) => "MalformedUpstreamResponse",
            ProxyError::ChunkParseError(_) => "ChunkParseError",
            ProxyError::StartupBindFailure { .. } => "StartupBindFailure",
            ProxyError::QueueFull { .. } => "QueueFull",
            ProxyError::PayloadTooLarge { .. } => "PayloadTooLarge",
            ProxyError::RequestBody(_) => "RequestBody",
            ProxyError::Proxy(_) | ProxyError::Http(_) => "ProxyError",
            ProxyError::Configuration(_) | ProxyError::Core(_) => "Configuration",
            ProxyError::Metrics(_) => "Metrics",
            ProxyError::Io(_) => "Io",
        }
    }

    /// Whether the process should exit on this error
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::StartupBindFailure { .. }
                | ProxyError::Configuration(_)
                | ProxyError::Core(_)
        )
    }

    /// Short text body sent to the client
    fn client_message(&self) -> String {
        match self {
            ProxyError::UpstreamTimeout(_) => "Gateway Timeout".to_string(),
            ProxyError::UpstreamUnreachable(msg) => format!("Bad Gateway: {}", msg),
            ProxyError::QueueFull { .. } => "Service Unavailable: admission queue is full".to_string(),
            ProxyError::PayloadTooLarge { .. } => "Payload Too Large".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.to_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, self.client_message()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_error_status_codes() {
        assert_eq!(ProxyError::UpstreamTimeout(Duration::from_secs(1)).to_status_code(), 504);
        assert_eq!(ProxyError::UpstreamUnreachable("refused".into()).to_status_code(), 502);
        assert_eq!(ProxyError::QueueFull { limit: 4 }.to_status_code(), 503);
        assert_eq!(ProxyError::PayloadTooLarge { limit: 1 }.to_status_code(), 413);
    }

    #[test]
    fn test_error_type_labels() {
        assert_eq!(ProxyError::UpstreamTimeout(Duration::ZERO).error_type(), "UpstreamTimeout");
        assert_eq!(
            ProxyError::UpstreamUnreachable(String::new()).error_type(),
            "UpstreamUnreachable"
        );
        assert_eq!(ProxyError::QueueFull { limit: 1 }.error_type(), "QueueFull");
    }

    #[test]
    fn test_fatal_errors() {
        let bind = ProxyError::StartupBindFailure {
            addr: "127.0.0.1:11435".parse().unwrap(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(bind.is_fatal());
        assert!(bind.to_string().contains("127.0.0.1:11435"));
        assert!(!ProxyError::UpstreamTimeout(Duration::ZERO).is_fatal());
    }

    #[test]
    fn test_client_response() {
        let response = ProxyError::UpstreamTimeout(Duration::from_secs(300)).into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let response = ProxyError::UpstreamUnreachable("connection refused".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
