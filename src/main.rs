//! LLM Bridge Server - Main entry point
//!
//! This binary loads the configuration, then serves the Claude Messages API
//! in front of the configured OpenAI-compatible upstream.

use anyhow::Result;
use llm_bridge_rust::{
    api::{router, AppState},
    core::{init_metrics, init_tracing, AppConfig},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    // Detect optimal worker threads from environment or cgroup
    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or_else(|| detect_cpu_limit().unwrap_or(1));

    println!("Tokio runtime: using {} worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    init_tracing();
    init_metrics();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let config = AppConfig::load_or_env(&config_path)?;

    let host: IpAddr = config
        .server
        .host
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid server.host {:?}: {}", config.server.host, e))?;
    let addr = SocketAddr::new(host, config.server.port);

    tracing::info!(
        upstream = %config.upstream.api_base,
        bridge_enabled = config.bridge.enabled,
        trigger_prefix = %config.bridge.trigger_prefix,
        model_mappings = config.upstream.model_mapping.len(),
        thinking_model = ?config.thinking_model,
        "Configuration loaded"
    );

    let state = Arc::new(AppState::new(config)?);
    let app = router(state);

    tracing::info!("Starting LLM Bridge on {}", addr);
    tracing::info!("Claude API: /v1/messages");
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Shutdown signal received");
    }
}

/// Detect CPU limit from cgroup (for containerized environments)
fn detect_cpu_limit() -> Option<usize> {
    // cgroup v2
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        let parts: Vec<&str> = max.split_whitespace().collect();
        if parts.len() == 2 {
            if let (Ok(quota), Ok(period)) = (parts[0].parse::<i64>(), parts[1].parse::<i64>()) {
                if quota > 0 && period > 0 {
                    let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
                    println!("Detected CPU limit from cgroup v2: {} cores", cores);
                    return Some(cores);
                }
            }
        }
    }

    // cgroup v1
    let quota = read_cgroup_value("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")?;
    let period = read_cgroup_value("/sys/fs/cgroup/cpu/cpu.cfs_period_us")?;

    if quota > 0 && period > 0 {
        let cores = ((quota as f64 / period as f64).ceil() as usize).max(1);
        println!("Detected CPU limit from cgroup v1: {} cores", cores);
        Some(cores)
    } else {
        None
    }
}

fn read_cgroup_value(path: &str) -> Option<i64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}
