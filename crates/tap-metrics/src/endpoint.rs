//! HTTP endpoint for metrics exposition and health checks

use crate::{MetricsError, MetricsRegistry, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Static facts reported by `/health`
#[derive(Debug, Clone)]
pub struct HealthInfo {
    pub proxy_url: String,
    pub metrics_url: String,
    /// Primary backend as `name@host:port`
    pub upstream: String,
    /// Secondary backend, when enabled
    pub secondary: Option<String>,
}

#[derive(Debug, Clone)]
struct EndpointState {
    registry: MetricsRegistry,
    info: Arc<HealthInfo>,
    started_at: Instant,
}

/// Serves `/metrics` and `/health`, either on its own listener or merged into
/// another router through [`MetricsEndpoint::router`].
#[derive(Debug)]
pub struct MetricsEndpoint {
    state: EndpointState,
    local_addr: Option<SocketAddr>,
    server_handle: Option<tokio::task::JoinHandle<()>>,
}

impl MetricsEndpoint {
    pub fn new(registry: MetricsRegistry, info: HealthInfo) -> Self {
        Self {
            state: EndpointState {
                registry,
                info: Arc::new(info),
                started_at: Instant::now(),
            },
            local_addr: None,
            server_handle: None,
        }
    }

    /// Routes for embedding in another listener
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone())
    }

    /// Bind a dedicated listener and serve in the background.
    ///
    /// Returns the bound address, which differs from `bind_addr` when port 0
    /// was requested.
    pub async fn start(&mut self, bind_addr: SocketAddr) -> Result<SocketAddr> {
        if self.server_handle.is_some() {
            return Err(MetricsError::Config("Server already started".to_string()));
        }

        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let app = self.router().layer(TraceLayer::new_for_http());

        info!("Starting metrics endpoint on {}", local_addr);

        let server_handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("Metrics endpoint server error: {}", e);
            }
        });

        self.local_addr = Some(local_addr);
        self.server_handle = Some(server_handle);
        Ok(local_addr)
    }

    /// Stop the dedicated listener
    pub async fn stop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
            let _ = handle.await;
            info!("Metrics endpoint stopped");
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.server_handle.is_some()
    }
}

impl Drop for MetricsEndpoint {
    fn drop(&mut self) {
        if let Some(handle) = self.server_handle.take() {
            handle.abort();
        }
    }
}

async fn metrics_handler(State(state): State<EndpointState>) -> Response {
    match state.registry.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn health_handler(State(state): State<EndpointState>) -> Response {
    let info = &state.info;
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "proxy_url": info.proxy_url,
            "metrics_url": info.metrics_url,
            "upstream": info.upstream,
            "secondary": info.secondary,
            "queue": state.registry.queue_snapshot(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_info() -> HealthInfo {
        HealthInfo {
            proxy_url: "http://127.0.0.1:11435".to_string(),
            metrics_url: "http://127.0.0.1:8001/metrics".to_string(),
            upstream: "ollama@localhost:11434".to_string(),
            secondary: None,
        }
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let registry = MetricsRegistry::new().unwrap();
        registry.record_generated_tokens("m1", 7);
        let endpoint = MetricsEndpoint::new(registry, test_info());

        let response = endpoint
            .router()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            prometheus::TEXT_FORMAT
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("ollama_proxy_generated_tokens_total{model=\"m1\"} 7"));
    }

    #[tokio::test]
    async fn test_health_route() {
        let registry = MetricsRegistry::new().unwrap();
        registry.enqueue(None);
        let endpoint = MetricsEndpoint::new(registry, test_info());

        let response = endpoint
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["upstream"], "ollama@localhost:11434");
        assert_eq!(health["queue"]["current_size"], 1);
        assert!(health["secondary"].is_null());
    }

    #[tokio::test]
    async fn test_endpoint_start_stop() {
        let registry = MetricsRegistry::new().unwrap();
        let mut endpoint = MetricsEndpoint::new(registry, test_info());
        assert!(!endpoint.is_running());

        let addr = endpoint.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(endpoint.is_running());
        assert!(endpoint.start("127.0.0.1:0".parse().unwrap()).await.is_err());

        endpoint.stop().await;
        assert!(!endpoint.is_running());
    }

    #[tokio::test]
    async fn test_endpoint_bind_conflict() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();

        let registry = MetricsRegistry::new().unwrap();
        let mut endpoint = MetricsEndpoint::new(registry, test_info());
        let err = endpoint.start(addr).await.unwrap_err();
        assert!(matches!(err, MetricsError::Io(_)));
    }
}
