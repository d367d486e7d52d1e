//! Descheduler - evicts pods that violate placement, utilization or
//! lifecycle policies so the scheduler can place them again.
//!
//! Runs as a Deployment with a single replica, or as a Job when the
//! descheduling interval is zero.

use anyhow::{Context, Result};
use clap::Parser;
use descheduler_lib::{
    cluster::{KubeEvictor, KubeSnapshotSource},
    evictions::RetryPolicy,
    health::HealthRegistry,
    observability::{DeschedulerMetrics, StructuredLogger},
    utilization::MetricsServerSource,
    Descheduler, DeschedulerOptions, Policy,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const DESCHEDULER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let flags = config::Flags::parse();
    let config = config::DeschedulerConfig::load()?.merge(flags);
    info!(
        policy = %config.policy_config_file.display(),
        interval_secs = config.descheduling_interval_secs,
        dry_run = config.dry_run,
        "Descheduler configured"
    );

    let policy = Policy::load(&config.policy_config_file).with_context(|| {
        format!(
            "failed to load policy from {}",
            config.policy_config_file.display()
        )
    })?;
    if policy.prometheus.is_some() {
        warn!("Prometheus utilization is not supported; using the metrics API or requests");
    }

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let health_registry = HealthRegistry::new();
    let metrics = DeschedulerMetrics::new();
    metrics.set_build_info(DESCHEDULER_VERSION);

    let logger = StructuredLogger::new(&config.instance);
    logger.log_startup(DESCHEDULER_VERSION, policy.profiles.len(), config.dry_run);

    let options = DeschedulerOptions {
        dry_run: config.dry_run,
        max_parallel_nodes: config.max_parallel_nodes.max(1),
        cycle_timeout: config.cycle_timeout(),
        retry: RetryPolicy::default(),
    };
    let collect_metrics = policy.metrics_collector.enabled;
    let mut descheduler = Descheduler::new(
        policy,
        Arc::new(KubeSnapshotSource::new(client.clone())),
        Arc::new(KubeEvictor::new(client.clone())),
        options,
    )
    .context("invalid descheduler policy")?
    .with_health(health_registry.clone())
    .with_logger(logger.clone());
    if collect_metrics {
        descheduler = descheduler.with_utilization(Arc::new(MetricsServerSource::new(client)));
    }
    let descheduler = Arc::new(descheduler);

    // Start health, metrics and summary server
    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        descheduler.subscribe(),
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let interval = config.interval();
    let loop_handle = {
        let descheduler = descheduler.clone();
        tokio::spawn(async move { descheduler.run(interval, shutdown_rx).await })
    };

    if interval.is_zero() {
        loop_handle.await.context("descheduling loop panicked")?;
        logger.log_shutdown("single cycle completed");
    } else {
        tokio::signal::ctrl_c().await?;
        logger.log_shutdown("SIGINT received");
        let _ = shutdown_tx.send(());
        loop_handle.await.context("descheduling loop panicked")?;
    }

    api_handle.abort();
    info!("Shutting down");

    Ok(())
}
