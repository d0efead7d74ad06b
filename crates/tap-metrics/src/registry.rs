//! Process-wide metrics registry
//!
//! One `MetricsRegistry` is built at startup and cloned into every component
//! that records observations. Cloning is cheap; all clones share the same
//! Prometheus registry, metric families and queue state.

use crate::common::{LatencyBucket, ProxyMetrics, TokenPhase};
use crate::queue::{QueueDepth, QueueGauges, QueueSnapshot, QueueState};
use crate::system::ResourceSample;
use crate::{MetricsError, Result};
use prometheus::{Encoder, TextEncoder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tap_core::Routing;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsRegistryInner>,
}

#[derive(Debug)]
struct MetricsRegistryInner {
    registry: prometheus::Registry,
    metrics: ProxyMetrics,
    queue: QueueState,
    global_labels: HashMap<String, String>,
}

impl MetricsRegistry {
    /// Create a registry without global labels
    pub fn new() -> Result<Self> {
        MetricsRegistryBuilder::new().build()
    }

    fn with_labels(global_labels: HashMap<String, String>) -> Result<Self> {
        let registry = if global_labels.is_empty() {
            prometheus::Registry::new()
        } else {
            prometheus::Registry::new_custom(None, Some(global_labels.clone()))?
        };

        let metrics = ProxyMetrics::new()
            .map_err(|e| MetricsError::Registry(format!("Failed to create proxy metrics: {}", e)))?;
        metrics
            .register(&registry)
            .map_err(|e| MetricsError::Registry(format!("Failed to register metrics: {}", e)))?;

        let queue = QueueState::with_gauges(QueueGauges {
            size: metrics.queue.queue_size.clone(),
            peak: metrics.queue.queue_peak_size.clone(),
        });

        Ok(Self {
            inner: Arc::new(MetricsRegistryInner {
                registry,
                metrics,
                queue,
                global_labels,
            }),
        })
    }

    /// Metric families, for direct inspection
    pub fn metrics(&self) -> &ProxyMetrics {
        &self.inner.metrics
    }

    pub fn global_labels(&self) -> &HashMap<String, String> {
        &self.inner.global_labels
    }

    /// Record a completed request
    pub fn record_request(
        &self,
        method: &str,
        endpoint: &str,
        model: &str,
        status: u16,
        duration: Duration,
    ) {
        let status = status.to_string();
        let requests = &self.inner.metrics.requests;
        requests
            .requests_total
            .with_label_values(&[method, endpoint, model, &status])
            .inc();
        requests
            .request_duration_seconds
            .with_label_values(&[method, endpoint, model])
            .observe(duration.as_secs_f64());
    }

    /// Record a latency observation on a per-endpoint histogram
    pub fn record_endpoint_latency(
        &self,
        bucket: LatencyBucket,
        model: &str,
        streaming: bool,
        duration: Duration,
    ) {
        let secs = duration.as_secs_f64();
        let streaming = if streaming { "true" } else { "false" };
        let endpoints = &self.inner.metrics.endpoints;
        match bucket {
            LatencyBucket::Generate => endpoints
                .generate_duration_seconds
                .with_label_values(&[model, streaming])
                .observe(secs),
            LatencyBucket::Chat => endpoints
                .chat_duration_seconds
                .with_label_values(&[model, streaming])
                .observe(secs),
            LatencyBucket::ListModels => endpoints.list_models_duration_seconds.observe(secs),
            LatencyBucket::ShowModel => endpoints
                .show_model_duration_seconds
                .with_label_values(&[model])
                .observe(secs),
        }
    }

    pub fn record_error(&self, model: &str, error_type: &str) {
        debug!(model, error_type, "Recording proxy error");
        self.inner
            .metrics
            .requests
            .errors_total
            .with_label_values(&[model, error_type])
            .inc();
    }

    pub fn record_backend_request(&self, routing: Routing, status: u16) {
        self.inner
            .metrics
            .requests
            .backend_requests_total
            .with_label_values(&[routing.as_str(), &status.to_string()])
            .inc();
    }

    pub fn inc_active(&self, model: &str) {
        self.inner
            .metrics
            .requests
            .active_requests
            .with_label_values(&[model])
            .inc();
    }

    pub fn dec_active(&self, model: &str) {
        self.inner
            .metrics
            .requests
            .active_requests
            .with_label_values(&[model])
            .dec();
    }

    /// Current value of the active-requests gauge for a model
    pub fn active_requests(&self, model: &str) -> f64 {
        self.inner
            .metrics
            .requests
            .active_requests
            .with_label_values(&[model])
            .get()
    }

    pub fn record_prompt_tokens(&self, model: &str, tokens: u64) {
        self.inner
            .metrics
            .generation
            .prompt_tokens_total
            .with_label_values(&[model])
            .inc_by(tokens as f64);
    }

    pub fn record_generated_tokens(&self, model: &str, tokens: u64) {
        self.inner
            .metrics
            .generation
            .generated_tokens_total
            .with_label_values(&[model])
            .inc_by(tokens as f64);
    }

    pub fn record_tokens_per_second(&self, model: &str, phase: TokenPhase, rate: f64) {
        self.inner
            .metrics
            .generation
            .tokens_per_second
            .with_label_values(&[model, phase.as_str()])
            .observe(rate);
    }

    pub fn record_time_to_first_token(&self, model: &str, latency: Duration) {
        self.inner
            .metrics
            .generation
            .time_to_first_token_seconds
            .with_label_values(&[model])
            .observe(latency.as_secs_f64());
    }

    pub fn record_model_load(&self, model: &str, seconds: f64) {
        self.inner
            .metrics
            .generation
            .model_load_duration_seconds
            .with_label_values(&[model])
            .observe(seconds);
    }

    pub fn record_context_length(&self, model: &str, tokens: u64) {
        self.inner
            .metrics
            .generation
            .context_length
            .with_label_values(&[model])
            .observe(tokens as f64);
    }

    /// Record an arrival at the admission queue; the depth gauges are
    /// updated with it. Returns `None` when `limit` rejects the arrival.
    pub fn enqueue(&self, limit: Option<usize>) -> Option<QueueDepth> {
        self.inner.queue.enqueue(limit)
    }

    /// Record a departure from the admission queue
    pub fn dequeue(&self) {
        self.inner.queue.dequeue();
    }

    pub fn record_queue_wait(&self, model: &str, wait: Duration) {
        self.inner
            .metrics
            .queue
            .queue_wait_time_seconds
            .with_label_values(&[model])
            .observe(wait.as_secs_f64());
    }

    pub fn mark_processed(&self) {
        self.inner.queue.mark_processed();
    }

    /// Recompute the processing-rate gauge and reset the window
    pub fn refresh_processing_rate(&self) -> f64 {
        let rate = self.inner.queue.take_processing_rate();
        self.inner.metrics.queue.queue_processing_rate.set(rate);
        rate
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.inner.queue.snapshot()
    }

    /// Publish a resource sample. Fields the provider could not produce leave
    /// their gauges untouched.
    pub fn record_resource_sample(&self, sample: &ResourceSample) {
        let system = &self.inner.metrics.system;
        if let Some(cpu) = sample.cpu_percent {
            system.cpu_usage_percent.set(cpu);
        }
        if let Some(bytes) = sample.memory_bytes {
            system.memory_usage_bytes.set(bytes as f64);
        }
        if let Some(bytes) = sample.upstream_memory_bytes {
            system.upstream_memory_bytes.set(bytes as f64);
        }
        if let Some(percent) = sample.memory_pressure_percent {
            system.memory_pressure_percent.set(percent);
        }
        if let Some(percent) = sample.gpu_residency_percent {
            system.gpu_active_residency_percent.set(percent);
        }
        if let Some(mw) = sample.gpu_power_mw {
            system.gpu_power_milliwatts.set(mw);
        }
        if let Some(mw) = sample.cpu_power_mw {
            system.cpu_power_milliwatts.set(mw);
        }
        if let Some(pressure) = sample.thermal_pressure {
            system.thermal_pressure.set(pressure.level());
        }
    }

    /// Encode all registered families in the text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| MetricsError::Export(format!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer)
            .map_err(|e| MetricsError::Export(format!("Metrics are not valid UTF-8: {}", e)))
    }
}

/// Builder for [`MetricsRegistry`]
pub struct MetricsRegistryBuilder {
    global_labels: HashMap<String, String>,
}

impl MetricsRegistryBuilder {
    pub fn new() -> Self {
        Self {
            global_labels: HashMap::new(),
        }
    }

    /// Attach a constant label to every exported series
    pub fn with_global_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.global_labels.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<MetricsRegistry> {
        MetricsRegistry::with_labels(self.global_labels)
    }
}

impl Default for MetricsRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
