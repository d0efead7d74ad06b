//! Proxy listener

use crate::handler::{proxy_handler, ProxyState};
use crate::{ProxyError, Result};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// HTTP server forwarding every path upstream, optionally with the metrics
/// routes merged in
#[derive(Clone)]
pub struct ProxyServer {
    state: ProxyState,
    metrics_routes: Option<Router>,
}

impl ProxyServer {
    pub fn new(state: ProxyState) -> Self {
        Self {
            state,
            metrics_routes: None,
        }
    }

    /// Serve `/metrics` and `/health` from this listener instead of
    /// forwarding them
    pub fn with_metrics_routes(mut self, routes: Router) -> Self {
        self.metrics_routes = Some(routes);
        self
    }

    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    /// Create the Axum router
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .fallback(proxy_handler)
            .with_state(self.state.clone());

        if let Some(routes) = &self.metrics_routes {
            router = router.merge(routes.clone());
        }

        router.layer(TraceLayer::new_for_http())
    }

    /// Bind the listener
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ProxyError::StartupBindFailure { addr, source })
    }

    /// Serve on an already bound listener in the background until
    /// `shutdown` resolves, then let open connections finish
    pub fn spawn<F>(&self, listener: TcpListener, shutdown: F) -> JoinHandle<Result<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.router();

        tokio::spawn(async move {
            let addr = listener.local_addr()?;
            info!("Starting proxy server on {}", addr);

            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
                error!("Proxy server error: {}", e);
                return Err(ProxyError::Io(e));
            }

            Ok(())
        })
    }
}
