// Main entry point for the banner analysis service

use banner_analyzer::{
    core::Config,
    orchestration::BannerPipeline,
    server::{log_endpoints, router, AppState},
    utils::Metrics,
};

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Arc::new(Config::new().context("Failed to load configuration")?);

    let filter = EnvFilter::new(format!(
        "banner_analyzer={},tower_http={},ort=off",
        level_name(config.log_level()),
        level_name(config.log_level()),
    ));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("=== BANNER ANALYZER ===");
    info!(
        "Config: detector={} min_conf={:.2} iou={:.2} urls={} inferences={} classifier={:?}",
        config.detection.model_file,
        config.min_confidence(),
        config.iou_threshold(),
        config.max_concurrent_urls(),
        config.max_concurrent_inferences(),
        config.classifier.backend,
    );

    let metrics = Metrics::new();

    // Provision and load models before accepting traffic
    let pipeline = match BannerPipeline::from_config(Arc::clone(&config), metrics.clone()).await {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            error!("Startup failed: {:#}", e);
            return Err(e);
        }
    };

    let state = AppState {
        config: Arc::clone(&config),
        pipeline,
        metrics,
    };
    let app = router(state);

    let addr = format!("{}:{}", config.server_host(), config.server_port());
    log_endpoints(&addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

fn level_name(level: tracing::Level) -> &'static str {
    match level {
        tracing::Level::TRACE => "trace",
        tracing::Level::DEBUG => "debug",
        tracing::Level::INFO => "info",
        tracing::Level::WARN => "warn",
        tracing::Level::ERROR => "error",
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
