//! Periodic resource sampling
//!
//! A [`SystemSampler`] wakes on a fixed period, asks its
//! [`SystemMetricsProvider`] for a [`ResourceSample`], publishes the sample
//! and recomputes the queue processing rate.
//!
//! Only the process CPU and memory figures are measurements. GPU residency,
//! power draw and thermal pressure are heuristics: they come from
//! `powermetrics` when it can run without a password prompt, and otherwise
//! GPU residency is estimated from the inference server's CPU share.

use crate::{MetricsError, MetricsRegistry, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, System};
use tap_core::SamplerConfig;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const POWERMETRICS_TIMEOUT: Duration = Duration::from_secs(5);

/// Thermal pressure as reported by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermalPressure {
    Nominal,
    Moderate,
    Heavy,
    Critical,
}

impl ThermalPressure {
    /// Gauge value, 0 for nominal up to 3 for critical
    pub fn level(&self) -> f64 {
        match self {
            ThermalPressure::Nominal => 0.0,
            ThermalPressure::Moderate => 1.0,
            ThermalPressure::Heavy => 2.0,
            ThermalPressure::Critical => 3.0,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "nominal" => Some(ThermalPressure::Nominal),
            "moderate" | "fair" => Some(ThermalPressure::Moderate),
            "heavy" | "serious" => Some(ThermalPressure::Heavy),
            "trapping" | "sleeping" | "critical" => Some(ThermalPressure::Critical),
            _ => None,
        }
    }
}

/// One round of resource readings. Every field is optional; providers leave
/// out what they cannot observe.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceSample {
    /// Proxy process CPU percent
    pub cpu_percent: Option<f64>,
    /// Proxy process resident memory
    pub memory_bytes: Option<u64>,
    /// Summed resident memory of inference server processes
    pub upstream_memory_bytes: Option<u64>,
    /// Summed CPU percent of inference server processes
    pub upstream_cpu_percent: Option<f64>,
    /// Host memory in use as a percent of total
    pub memory_pressure_percent: Option<f64>,
    pub gpu_residency_percent: Option<f64>,
    pub gpu_power_mw: Option<f64>,
    pub cpu_power_mw: Option<f64>,
    pub thermal_pressure: Option<ThermalPressure>,
}

/// Source of resource readings for one platform
#[async_trait]
pub trait SystemMetricsProvider: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Take one sample
    async fn sample(&self) -> Result<ResourceSample>;
}

/// Provider that reports nothing
#[derive(Debug, Default)]
pub struct NullProvider;

#[async_trait]
impl SystemMetricsProvider for NullProvider {
    fn name(&self) -> &'static str {
        "null"
    }

    async fn sample(&self) -> Result<ResourceSample> {
        Ok(ResourceSample::default())
    }
}

/// Cross-platform process and memory readings via `sysinfo`
pub struct SysinfoProvider {
    system: Arc<Mutex<System>>,
    process_filter: String,
}

impl SysinfoProvider {
    pub fn new(process_filter: impl Into<String>) -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new_all())),
            process_filter: process_filter.into().to_lowercase(),
        }
    }
}

#[async_trait]
impl SystemMetricsProvider for SysinfoProvider {
    fn name(&self) -> &'static str {
        "sysinfo"
    }

    async fn sample(&self) -> Result<ResourceSample> {
        let system = Arc::clone(&self.system);
        let filter = self.process_filter.clone();

        // refresh_all walks /proc (or the platform equivalent) and blocks
        tokio::task::spawn_blocking(move || {
            let mut sys = system.lock();
            sys.refresh_all();

            let own_pid = Pid::from_u32(std::process::id());
            let (cpu_percent, memory_bytes) = sys
                .process(own_pid)
                .map(|p| (Some(p.cpu_usage() as f64), Some(p.memory())))
                .unwrap_or((None, None));

            let mut upstream_memory = 0u64;
            let mut upstream_cpu = 0f64;
            let mut matched = false;
            if !filter.is_empty() {
                for (pid, process) in sys.processes() {
                    if *pid == own_pid {
                        continue;
                    }
                    if process.name().to_string_lossy().to_lowercase().contains(&filter) {
                        matched = true;
                        upstream_memory += process.memory();
                        upstream_cpu += process.cpu_usage() as f64;
                    }
                }
            }

            let total = sys.total_memory();
            let memory_pressure_percent = if total > 0 {
                Some(sys.used_memory() as f64 / total as f64 * 100.0)
            } else {
                None
            };

            let cpus = sys.cpus().len().max(1) as f64;

            ResourceSample {
                cpu_percent,
                memory_bytes,
                upstream_memory_bytes: matched.then_some(upstream_memory),
                // Normalised to whole-machine percent
                upstream_cpu_percent: matched.then_some(upstream_cpu / cpus),
                memory_pressure_percent,
                ..Default::default()
            }
        })
        .await
        .map_err(|e| MetricsError::Sampler(format!("sysinfo task failed: {}", e)))
    }
}

/// macOS provider layering `powermetrics` readings over [`SysinfoProvider`].
///
/// `powermetrics` needs root, so it is run through `sudo -n` and abandoned
/// after the first failure. Without it the GPU residency is estimated from
/// the inference server's CPU share.
pub struct PowermetricsProvider {
    base: SysinfoProvider,
    powermetrics_available: AtomicBool,
}

impl PowermetricsProvider {
    pub fn new(process_filter: impl Into<String>) -> Self {
        Self {
            base: SysinfoProvider::new(process_filter),
            powermetrics_available: AtomicBool::new(true),
        }
    }

    async fn run_powermetrics(&self) -> Option<PowermetricsReading> {
        if !self.powermetrics_available.load(Ordering::Relaxed) {
            return None;
        }

        let command = tokio::process::Command::new("sudo")
            .args([
                "-n",
                "powermetrics",
                "--samplers",
                "gpu_power,cpu_power,thermal",
                "-i",
                "1000",
                "-n",
                "1",
            ])
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(POWERMETRICS_TIMEOUT, command).await {
            Ok(Ok(output)) if output.status.success() => {
                Some(parse_powermetrics(&String::from_utf8_lossy(&output.stdout)))
            }
            Ok(Ok(output)) => {
                info!(
                    "powermetrics unavailable (exit status {}), falling back to estimates",
                    output.status
                );
                self.powermetrics_available.store(false, Ordering::Relaxed);
                None
            }
            Ok(Err(e)) => {
                info!("powermetrics could not be started ({}), falling back to estimates", e);
                self.powermetrics_available.store(false, Ordering::Relaxed);
                None
            }
            Err(_) => {
                debug!("powermetrics sample timed out");
                None
            }
        }
    }
}

#[async_trait]
impl SystemMetricsProvider for PowermetricsProvider {
    fn name(&self) -> &'static str {
        "powermetrics"
    }

    async fn sample(&self) -> Result<ResourceSample> {
        let mut sample = self.base.sample().await?;

        match self.run_powermetrics().await {
            Some(reading) => {
                sample.gpu_residency_percent = reading.gpu_residency_percent;
                sample.gpu_power_mw = reading.gpu_power_mw;
                sample.cpu_power_mw = reading.cpu_power_mw;
                sample.thermal_pressure = reading.thermal_pressure;
            }
            None => {
                sample.gpu_residency_percent = sample.upstream_cpu_percent.map(estimate_gpu_residency);
            }
        }

        Ok(sample)
    }
}

/// Fields recognised in `powermetrics` text output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowermetricsReading {
    pub gpu_residency_percent: Option<f64>,
    pub gpu_power_mw: Option<f64>,
    pub cpu_power_mw: Option<f64>,
    pub thermal_pressure: Option<ThermalPressure>,
}

/// Parse the text output of `powermetrics`. Unrecognised lines are skipped.
pub fn parse_powermetrics(output: &str) -> PowermetricsReading {
    let mut reading = PowermetricsReading::default();

    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("GPU HW active residency:") {
            reading.gpu_residency_percent = parse_percent(rest);
        } else if let Some(rest) = line.strip_prefix("GPU Power:") {
            reading.gpu_power_mw = parse_milliwatts(rest);
        } else if let Some(rest) = line.strip_prefix("CPU Power:") {
            reading.cpu_power_mw = parse_milliwatts(rest);
        } else if let Some(rest) = line.strip_prefix("Package Power:") {
            // Package power includes the CPU; only used when CPU power is absent
            if reading.cpu_power_mw.is_none() {
                reading.cpu_power_mw = parse_milliwatts(rest);
            }
        } else if let Some(rest) = line.strip_prefix("Current pressure level:") {
            reading.thermal_pressure = ThermalPressure::parse(rest);
        }
    }

    reading
}

fn parse_percent(value: &str) -> Option<f64> {
    // "  58.06% (338 MHz: 12% ...)"
    let value = value.split('(').next()?.trim().trim_end_matches('%');
    value.trim().parse().ok()
}

fn parse_milliwatts(value: &str) -> Option<f64> {
    value.split_whitespace().next()?.parse().ok()
}

/// Estimate GPU residency from the inference server's CPU share. A server
/// offloading to the GPU keeps one host thread busy feeding it, so CPU
/// activity is a coarse proxy for GPU activity.
pub fn estimate_gpu_residency(upstream_cpu_percent: f64) -> f64 {
    (upstream_cpu_percent * 4.0).clamp(0.0, 100.0)
}

/// Pick the provider for the current platform
pub fn default_provider(config: &SamplerConfig) -> Arc<dyn SystemMetricsProvider> {
    if cfg!(target_os = "macos") && config.estimate_platform_metrics {
        Arc::new(PowermetricsProvider::new(config.upstream_process_name.clone()))
    } else {
        Arc::new(SysinfoProvider::new(config.upstream_process_name.clone()))
    }
}

/// Background task publishing resource gauges and the queue processing rate
pub struct SystemSampler {
    registry: MetricsRegistry,
    provider: Arc<dyn SystemMetricsProvider>,
    interval: Duration,
}

impl SystemSampler {
    pub fn new(
        registry: MetricsRegistry,
        provider: Arc<dyn SystemMetricsProvider>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            provider,
            interval,
        }
    }

    /// Run one sampling round
    pub async fn sample_once(&self) {
        match self.provider.sample().await {
            Ok(sample) => {
                debug!(provider = self.provider.name(), ?sample, "Resource sample");
                self.registry.record_resource_sample(&sample);
            }
            Err(e) => warn!(provider = self.provider.name(), "Resource sampling failed: {}", e),
        }

        let rate = self.registry.refresh_processing_rate();
        debug!(rate, "Queue processing rate");
    }

    /// Spawn the sampling loop. Abort the returned handle to stop it.
    pub fn start(self) -> JoinHandle<()> {
        info!(
            provider = self.provider.name(),
            "Starting system sampler every {:?}", self.interval
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sample_once().await;
            }
        })
    }
}
