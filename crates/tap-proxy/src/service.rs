//! Service lifecycle: listeners, sampler and shutdown

use crate::handler::ProxyState;
use crate::server::ProxyServer;
use crate::{ProxyError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tap_core::Config;
use tap_metrics::{default_provider, HealthInfo, MetricsEndpoint, MetricsError, MetricsRegistry, SystemSampler};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// How long listeners get to finish open connections on shutdown
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Addresses the service ended up listening on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundAddrs {
    pub proxy: SocketAddr,
    /// `None` when metrics are served on the proxy listener
    pub metrics: Option<SocketAddr>,
}

/// The proxy with its metrics endpoint and resource sampler
pub struct MonitoringProxy {
    config: Config,
    registry: MetricsRegistry,
    server: ProxyServer,
    endpoint: Mutex<MetricsEndpoint>,
    shutdown_tx: watch::Sender<bool>,
    server_handles: Mutex<Vec<JoinHandle<Result<()>>>>,
    sampler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MonitoringProxy {
    /// Create the service with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let registry = MetricsRegistry::new()?;
        let state = ProxyState::new(config.clone(), registry.clone());

        let info = HealthInfo {
            proxy_url: config.proxy_url(),
            metrics_url: config.metrics_url(),
            upstream: state.primary().describe(),
            secondary: state.secondary().map(|b| b.describe()),
        };
        let endpoint = MetricsEndpoint::new(registry.clone(), info);

        let mut server = ProxyServer::new(state);
        if config.metrics.port.is_none() {
            server = server.with_metrics_routes(endpoint.router());
        }

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            registry,
            server,
            endpoint: Mutex::new(endpoint),
            shutdown_tx,
            server_handles: Mutex::new(Vec::new()),
            sampler_handle: Mutex::new(None),
        })
    }

    /// Bind the listeners and start serving in the background
    pub async fn start(&self) -> Result<BoundAddrs> {
        let proxy_addr = self.config.proxy_bind_addr()?;
        let listener = ProxyServer::bind(proxy_addr).await?;
        let proxy = listener.local_addr()?;

        let metrics = match self.config.metrics_bind_addr() {
            Some(addr) => {
                let addr = addr?;
                let bound = self
                    .endpoint
                    .lock()
                    .await
                    .start(addr)
                    .await
                    .map_err(|e| match e {
                        MetricsError::Io(source) => ProxyError::StartupBindFailure { addr, source },
                        other => ProxyError::Metrics(other),
                    })?;
                Some(bound)
            }
            None => None,
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = self.server.spawn(listener, async move {
            // Only ever set once; a closed channel also means stop
            let _ = shutdown_rx.changed().await;
        });
        self.server_handles.lock().await.push(handle);

        if self.config.sampler.enabled {
            let sampler = SystemSampler::new(
                self.registry.clone(),
                default_provider(&self.config.sampler),
                self.config.sampler.interval(),
            );
            *self.sampler_handle.lock().await = Some(sampler.start());
        }

        info!(
            proxy = %proxy,
            metrics = %metrics.map_or_else(|| format!("{}/metrics", proxy), |m| m.to_string()),
            upstream = %self.server.state().primary().describe(),
            max_concurrency = self.config.proxy.max_concurrency,
            "Monitoring proxy started"
        );

        Ok(BoundAddrs { proxy, metrics })
    }

    /// Serve and block until a shutdown signal arrives
    pub async fn serve(&self) -> Result<()> {
        self.start().await?;

        Self::wait_for_shutdown().await;

        self.shutdown().await
    }

    /// Wait for Ctrl-C or SIGTERM
    async fn wait_for_shutdown() {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, shutting down");
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    /// Stop accepting connections, let in-flight requests finish and stop
    /// the sampler and metrics listener
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down monitoring proxy");

        self.shutdown_tx.send_replace(true);

        if let Some(sampler) = self.sampler_handle.lock().await.take() {
            sampler.abort();
        }

        let mut handles = self.server_handles.lock().await;
        for mut handle in handles.drain(..) {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("Proxy server exited with error: {}", e),
                Ok(Err(e)) => warn!("Proxy server task failed: {}", e),
                Err(_) => {
                    warn!("Proxy server did not shut down within {:?}, aborting", SHUTDOWN_TIMEOUT);
                    handle.abort();
                }
            }
        }

        self.endpoint.lock().await.stop().await;

        info!("Monitoring proxy shutdown complete");
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn state(&self) -> &ProxyState {
        self.server.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tap_core::ConfigBuilder;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn test_config(metrics_port: Option<u16>) -> Config {
        ConfigBuilder::new()
            .proxy_port(free_port())
            .metrics_port(metrics_port)
            .sampler_enabled(false)
            .build()
    }

    #[tokio::test]
    async fn test_start_and_shutdown_merged() {
        let proxy = MonitoringProxy::new(test_config(None)).unwrap();
        let addrs = proxy.start().await.unwrap();

        assert_eq!(addrs.proxy.port(), proxy.config().proxy.port);
        assert!(addrs.metrics.is_none());

        proxy.shutdown().await.unwrap();
        assert!(proxy.server_handles.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_port_in_use_is_bind_failure() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let proxy = MonitoringProxy::new(test_config(Some(port))).unwrap();
        let err = proxy.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::StartupBindFailure { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ConfigBuilder::new().max_concurrency(0).build();
        assert!(MonitoringProxy::new(config).is_err());
    }
}
