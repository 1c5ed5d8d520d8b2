use anyhow::{Context, Result};
use mosb_gateway::{start_api_server, AppState, GatewayConfig};
use mosb_pipeline::event::now_millis;
use mosb_pipeline::Pipeline;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = GatewayConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level);

    info!(service = %config.service.name, "Starting MOSB gateway");

    init_metrics(config.service.metrics_port)?;

    let pipeline = Arc::new(Pipeline::from_config(&config.pipeline).context("Failed to initialize pipeline")?);

    let api_state = AppState {
        pipeline: Arc::clone(&pipeline),
        ping_interval: config.ping_interval(),
    };

    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    // Sliding-window prune
    let prune_interval = config.prune_interval();
    let prune_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(prune_interval);
        loop {
            tick.tick().await;
            pipeline.prune_window(now_millis());
        }
    });

    info!("Gateway started successfully");

    shutdown_signal().await;

    info!("Shutting down gateway");

    api_handle.abort();
    prune_handle.abort();

    info!("Gateway stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
