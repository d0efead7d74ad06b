//! ollama-tap binary

use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use std::path::Path;
use std::process;
use std::time::Duration;
use tap_core::{Config, ConfigBuilder};
use tap_proxy::logging::init_logging;
use tap_proxy::MonitoringProxy;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    // Logging is configured from the loaded settings, so report this one directly
    let config = match build_config(&matches) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Failed to initialise logging: {}", e);
        process::exit(1);
    }

    info!("Starting ollama-tap with configuration:");
    info!("  Proxy: {}", config.proxy_url());
    info!("  Metrics: {}", config.metrics_url());
    info!("  Upstream: {}@{}", config.upstream.name, config.upstream.authority());
    if config.secondary.enabled {
        info!("  Secondary: {}@{}", config.secondary.name, config.secondary.authority());
    }
    info!("  Max concurrency: {}", config.proxy.max_concurrency);
    match config.proxy.max_queue_size {
        Some(limit) => info!("  Max queue size: {}", limit),
        None => info!("  Max queue size: unbounded"),
    }
    info!("  Request timeout: {:?}", config.proxy.request_timeout());
    info!("  Resource sampler enabled: {}", config.sampler.enabled);

    let proxy = match MonitoringProxy::new(config) {
        Ok(proxy) => proxy,
        Err(e) => {
            error!("Failed to create proxy: {}", e);
            process::exit(1);
        }
    };

    // Blocks until Ctrl-C or SIGTERM
    if let Err(e) = proxy.serve().await {
        error!("Proxy error: {}", e);
        process::exit(1);
    }

    info!("ollama-tap shutdown complete");
}

fn cli() -> Command {
    Command::new("ollama-tap")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Monitoring reverse proxy for a local LLM inference server")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (YAML)"),
        )
        .arg(
            Arg::new("upstream-host")
                .long("upstream-host")
                .value_name("HOST")
                .help("Inference server host"),
        )
        .arg(
            Arg::new("upstream-port")
                .long("upstream-port")
                .value_name("PORT")
                .help("Inference server port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("proxy-port")
                .short('p')
                .long("proxy-port")
                .value_name("PORT")
                .help("Proxy listen port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("metrics-port")
                .long("metrics-port")
                .value_name("PORT")
                .help("Dedicated metrics and health port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("metrics-on-proxy")
                .long("metrics-on-proxy")
                .help("Serve /metrics and /health on the proxy listener")
                .action(clap::ArgAction::SetTrue)
                .conflicts_with("metrics-port"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("Bind address for the proxy listener"),
        )
        .arg(
            Arg::new("max-concurrency")
                .long("max-concurrency")
                .value_name("COUNT")
                .help("Maximum requests executing against the backend at once")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-queue-size")
                .long("max-queue-size")
                .value_name("COUNT")
                .help("Reject requests with 503 once this many are waiting")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("request-timeout")
                .long("request-timeout")
                .value_name("SECONDS")
                .help("Total timeout for one upstream call in seconds")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("enable-secondary")
                .long("enable-secondary")
                .help("Enable the secondary backend")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("secondary-host")
                .long("secondary-host")
                .value_name("HOST")
                .help("Secondary backend host"),
        )
        .arg(
            Arg::new("secondary-port")
                .long("secondary-port")
                .value_name("PORT")
                .help("Secondary backend port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("disable-sampler")
                .long("disable-sampler")
                .help("Disable background resource sampling")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("FILTER")
                .help("Log level or filter directive"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("Log output format")
                .value_parser(["text", "json"]),
        )
}

/// Build configuration from the config file, environment and command line
fn build_config(matches: &ArgMatches) -> anyhow::Result<Config> {
    let path = matches.get_one::<String>("config").map(Path::new);
    let base = Config::load_with(path).context("Failed to load configuration")?;

    let upstream_host = matches
        .get_one::<String>("upstream-host")
        .cloned()
        .unwrap_or_else(|| base.upstream.host.clone());
    let upstream_port = matches
        .get_one::<u16>("upstream-port")
        .copied()
        .unwrap_or(base.upstream.port);

    let secondary_requested = matches.get_flag("enable-secondary")
        || matches.contains_id("secondary-host")
        || matches.contains_id("secondary-port");
    let secondary = (secondary_requested || base.secondary.enabled).then(|| {
        let host = matches
            .get_one::<String>("secondary-host")
            .cloned()
            .unwrap_or_else(|| base.secondary.host.clone());
        let port = matches
            .get_one::<u16>("secondary-port")
            .copied()
            .unwrap_or(base.secondary.port);
        (host, port)
    });

    let mut builder = ConfigBuilder::from_config(base).upstream(upstream_host, upstream_port);

    if let Some((host, port)) = secondary {
        builder = builder.secondary(host, port);
    }

    if let Some(&port) = matches.get_one::<u16>("proxy-port") {
        builder = builder.proxy_port(port);
    }

    if let Some(&port) = matches.get_one::<u16>("metrics-port") {
        builder = builder.metrics_port(Some(port));
    }

    if matches.get_flag("metrics-on-proxy") {
        builder = builder.metrics_port(None);
    }

    if let Some(bind) = matches.get_one::<String>("bind") {
        builder = builder.bind_address(bind);
    }

    if let Some(&max) = matches.get_one::<usize>("max-concurrency") {
        builder = builder.max_concurrency(max);
    }

    if let Some(&max) = matches.get_one::<usize>("max-queue-size") {
        builder = builder.max_queue_size(Some(max));
    }

    if let Some(&secs) = matches.get_one::<u64>("request-timeout") {
        builder = builder.request_timeout(Duration::from_secs(secs));
    }

    if matches.get_flag("disable-sampler") {
        builder = builder.sampler_enabled(false);
    }

    if let Some(level) = matches.get_one::<String>("log-level") {
        builder = builder.log_level(level);
    }

    if let Some(format) = matches.get_one::<String>("log-format") {
        builder = builder.log_format(format);
    }

    let config = builder.build();
    config.validate().context("Configuration validation failed")?;

    Ok(config)
}
