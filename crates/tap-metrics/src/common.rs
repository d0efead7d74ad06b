//! Metric families exposed by the proxy
//!
//! Every family is created once with a fixed label set and registered against
//! a single [`prometheus::Registry`]. Label values are restricted to model,
//! endpoint, method, status, routing, error_type, phase and the streaming flag.

use prometheus::{CounterVec, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, Opts};

/// Prefix shared by every exported metric name
pub const METRIC_PREFIX: &str = "ollama_proxy";

fn name(suffix: &str) -> String {
    format!("{}_{}", METRIC_PREFIX, suffix)
}

/// Per-endpoint latency histograms that carry their own name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyBucket {
    Generate,
    Chat,
    ListModels,
    ShowModel,
}

impl LatencyBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            LatencyBucket::Generate => "generate",
            LatencyBucket::Chat => "chat",
            LatencyBucket::ListModels => "list_models",
            LatencyBucket::ShowModel => "show_model",
        }
    }
}

/// Which token count a throughput observation was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPhase {
    /// Generated tokens over generation time
    Eval,
    /// Prompt tokens over prompt processing time
    PromptEval,
}

impl TokenPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPhase::Eval => "eval",
            TokenPhase::PromptEval => "prompt_eval",
        }
    }
}

/// Request level counters and latency
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    /// Completed requests
    pub requests_total: CounterVec,

    /// End-to-end duration of completed requests
    pub request_duration_seconds: HistogramVec,

    /// Requests currently executing against the backend
    pub active_requests: GaugeVec,

    /// Failed upstream calls and rejected requests
    pub errors_total: CounterVec,

    /// Forwarded requests per destination backend
    pub backend_requests_total: CounterVec,
}

impl RequestMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            requests_total: CounterVec::new(
                Opts::new(name("requests_total"), "Total number of proxied requests"),
                &["method", "endpoint", "model", "status"],
            )?,
            request_duration_seconds: HistogramVec::new(
                HistogramOpts::new(name("request_duration_seconds"), "Request duration in seconds")
                    .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
                &["method", "endpoint", "model"],
            )?,
            active_requests: GaugeVec::new(
                Opts::new(name("active_requests"), "Number of requests currently executing"),
                &["model"],
            )?,
            errors_total: CounterVec::new(
                Opts::new(name("errors_total"), "Total number of proxy errors"),
                &["model", "error_type"],
            )?,
            backend_requests_total: CounterVec::new(
                Opts::new(name("backend_requests_total"), "Forwarded requests per backend"),
                &["routing", "status"],
            )?,
        })
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.requests_total.clone()))?;
        registry.register(Box::new(self.request_duration_seconds.clone()))?;
        registry.register(Box::new(self.active_requests.clone()))?;
        registry.register(Box::new(self.errors_total.clone()))?;
        registry.register(Box::new(self.backend_requests_total.clone()))?;
        Ok(())
    }
}

/// Metrics extracted from inference responses
#[derive(Debug, Clone)]
pub struct GenerationMetrics {
    pub prompt_tokens_total: CounterVec,
    pub generated_tokens_total: CounterVec,
    pub tokens_per_second: HistogramVec,
    pub time_to_first_token_seconds: HistogramVec,
    pub model_load_duration_seconds: HistogramVec,
    pub context_length: HistogramVec,
}

impl GenerationMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            prompt_tokens_total: CounterVec::new(
                Opts::new(name("prompt_tokens_total"), "Total prompt tokens processed"),
                &["model"],
            )?,
            generated_tokens_total: CounterVec::new(
                Opts::new(name("generated_tokens_total"), "Total tokens generated"),
                &["model"],
            )?,
            tokens_per_second: HistogramVec::new(
                HistogramOpts::new(name("tokens_per_second"), "Token throughput per response")
                    .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0]),
                &["model", "phase"],
            )?,
            time_to_first_token_seconds: HistogramVec::new(
                HistogramOpts::new(
                    name("time_to_first_token_seconds"),
                    "Time from request start to the first generated chunk",
                )
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]),
                &["model"],
            )?,
            model_load_duration_seconds: HistogramVec::new(
                HistogramOpts::new(name("model_load_duration_seconds"), "Model load duration in seconds")
                    .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
                &["model"],
            )?,
            context_length: HistogramVec::new(
                HistogramOpts::new(name("context_length"), "Prompt plus generated tokens per response")
                    .buckets(vec![128.0, 256.0, 512.0, 1024.0, 2048.0, 4096.0, 8192.0, 16384.0, 32768.0]),
                &["model"],
            )?,
        })
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.prompt_tokens_total.clone()))?;
        registry.register(Box::new(self.generated_tokens_total.clone()))?;
        registry.register(Box::new(self.tokens_per_second.clone()))?;
        registry.register(Box::new(self.time_to_first_token_seconds.clone()))?;
        registry.register(Box::new(self.model_load_duration_seconds.clone()))?;
        registry.register(Box::new(self.context_length.clone()))?;
        Ok(())
    }
}

/// Latency histograms for well-known inference endpoints
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    pub generate_duration_seconds: HistogramVec,
    pub chat_duration_seconds: HistogramVec,
    pub list_models_duration_seconds: Histogram,
    pub show_model_duration_seconds: HistogramVec,
}

impl EndpointMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let inference_buckets = vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];
        let metadata_buckets = vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

        Ok(Self {
            generate_duration_seconds: HistogramVec::new(
                HistogramOpts::new(name("generate_duration_seconds"), "Generate endpoint latency")
                    .buckets(inference_buckets.clone()),
                &["model", "streaming"],
            )?,
            chat_duration_seconds: HistogramVec::new(
                HistogramOpts::new(name("chat_duration_seconds"), "Chat endpoint latency")
                    .buckets(inference_buckets),
                &["model", "streaming"],
            )?,
            list_models_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(name("list_models_duration_seconds"), "Model listing latency")
                    .buckets(metadata_buckets.clone()),
            )?,
            show_model_duration_seconds: HistogramVec::new(
                HistogramOpts::new(name("show_model_duration_seconds"), "Model detail latency")
                    .buckets(metadata_buckets),
                &["model"],
            )?,
        })
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.generate_duration_seconds.clone()))?;
        registry.register(Box::new(self.chat_duration_seconds.clone()))?;
        registry.register(Box::new(self.list_models_duration_seconds.clone()))?;
        registry.register(Box::new(self.show_model_duration_seconds.clone()))?;
        Ok(())
    }
}

/// Admission queue gauges
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    pub queue_size: Gauge,
    pub queue_peak_size: Gauge,
    pub queue_processing_rate: Gauge,
    pub queue_wait_time_seconds: HistogramVec,
}

impl QueueMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            queue_size: Gauge::with_opts(Opts::new(
                name("queue_size"),
                "Requests waiting for admission",
            ))?,
            queue_peak_size: Gauge::with_opts(Opts::new(
                name("queue_peak_size"),
                "Largest queue size seen since start",
            ))?,
            queue_processing_rate: Gauge::with_opts(Opts::new(
                name("queue_processing_rate"),
                "Requests completed per second over the last sampling window",
            ))?,
            queue_wait_time_seconds: HistogramVec::new(
                HistogramOpts::new(name("queue_wait_time_seconds"), "Time spent waiting for admission")
                    .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
                &["model"],
            )?,
        })
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.queue_size.clone()))?;
        registry.register(Box::new(self.queue_peak_size.clone()))?;
        registry.register(Box::new(self.queue_processing_rate.clone()))?;
        registry.register(Box::new(self.queue_wait_time_seconds.clone()))?;
        Ok(())
    }
}

/// Host and process resource gauges.
///
/// The GPU, power and thermal gauges are heuristics and must not be read as
/// measured values.
#[derive(Debug, Clone)]
pub struct SystemMetrics {
    pub cpu_usage_percent: Gauge,
    pub memory_usage_bytes: Gauge,
    pub upstream_memory_bytes: Gauge,
    pub memory_pressure_percent: Gauge,
    pub gpu_active_residency_percent: Gauge,
    pub gpu_power_milliwatts: Gauge,
    pub cpu_power_milliwatts: Gauge,
    pub thermal_pressure: Gauge,
}

impl SystemMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let gauge = |suffix: &str, help: &str| Gauge::with_opts(Opts::new(name(suffix), help));

        Ok(Self {
            cpu_usage_percent: gauge("cpu_usage_percent", "Proxy process CPU usage percent")?,
            memory_usage_bytes: gauge("memory_usage_bytes", "Proxy process resident memory in bytes")?,
            upstream_memory_bytes: gauge(
                "upstream_memory_bytes",
                "Summed resident memory of inference server processes",
            )?,
            memory_pressure_percent: gauge(
                "memory_pressure_percent",
                "Host memory in use as a percent of total (estimate)",
            )?,
            gpu_active_residency_percent: gauge(
                "gpu_active_residency_percent",
                "GPU active residency percent (estimate)",
            )?,
            gpu_power_milliwatts: gauge("gpu_power_milliwatts", "GPU power draw in milliwatts (estimate)")?,
            cpu_power_milliwatts: gauge("cpu_power_milliwatts", "CPU package power in milliwatts (estimate)")?,
            thermal_pressure: gauge(
                "thermal_pressure",
                "Thermal pressure level, 0 nominal to 3 critical (estimate)",
            )?,
        })
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.cpu_usage_percent.clone()))?;
        registry.register(Box::new(self.memory_usage_bytes.clone()))?;
        registry.register(Box::new(self.upstream_memory_bytes.clone()))?;
        registry.register(Box::new(self.memory_pressure_percent.clone()))?;
        registry.register(Box::new(self.gpu_active_residency_percent.clone()))?;
        registry.register(Box::new(self.gpu_power_milliwatts.clone()))?;
        registry.register(Box::new(self.cpu_power_milliwatts.clone()))?;
        registry.register(Box::new(self.thermal_pressure.clone()))?;
        Ok(())
    }
}

/// All metric families owned by one proxy process
#[derive(Debug, Clone)]
pub struct ProxyMetrics {
    pub requests: RequestMetrics,
    pub generation: GenerationMetrics,
    pub endpoints: EndpointMetrics,
    pub queue: QueueMetrics,
    pub system: SystemMetrics,
}

impl ProxyMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            requests: RequestMetrics::new()?,
            generation: GenerationMetrics::new()?,
            endpoints: EndpointMetrics::new()?,
            queue: QueueMetrics::new()?,
            system: SystemMetrics::new()?,
        })
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        self.requests.register(registry)?;
        self.generation.register(registry)?;
        self.endpoints.register(registry)?;
        self.queue.register(registry)?;
        self.system.register(registry)?;
        Ok(())
    }
}
