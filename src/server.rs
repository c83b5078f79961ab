// HTTP surface: analyze endpoint plus monitoring endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::core::types::{AnalyzeRequest, AnalyzeResponse};
use crate::core::Config;
use crate::orchestration::BannerPipeline;
use crate::utils::Metrics;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: Arc<BannerPipeline>,
    pub metrics: Metrics,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/stats", get(stats_endpoint))
        .route("/analyze", post(analyze))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

pub fn log_endpoints(addr: &str) {
    info!("{}", "=".repeat(70));
    info!("Server starting on http://{}", addr);
    info!("{}", "-".repeat(70));
    info!("Endpoints:");
    info!("  GET  /         - Root endpoint");
    info!("  GET  /health   - Health check");
    info!("  GET  /metrics  - Prometheus metrics");
    info!("  GET  /stats    - Detailed statistics");
    info!("  POST /analyze  - Analyze banner images (JSON)");
    info!("{}", "=".repeat(70));
}

async fn root() -> &'static str {
    "Banner Analyzer"
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "backend": state.pipeline.backend_type(),
        "classifier": match state.config.classifier.backend {
            crate::core::config::ClassifierBackend::Llm => "llm",
            crate::core::config::ClassifierBackend::Keyword => "keyword",
        },
    }))
}

/// Prometheus metrics endpoint
async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

/// Detailed statistics endpoint (JSON)
async fn stats_endpoint(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let snapshot = state.metrics.snapshot();
    let circuit = state.pipeline.classifier().circuit_stats();

    serde_json::to_value(snapshot)
        .map(|mut value| {
            value["classifier_circuit"] = serde_json::json!(circuit);
            Json(value)
        })
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to serialize metrics: {}", e),
            )
        })
}

/// Analyze endpoint
///
/// Always answers 200 once the body parses; per-URL failures only shrink
/// the banner list.
async fn analyze(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeRequest>,
) -> Json<AnalyzeResponse> {
    info!(
        "Received analyze request: report_id={}, {} urls",
        request.report_id,
        request.image_urls.len()
    );
    Json(state.pipeline.process_request(request).await)
}
