//! HTTP API gateway for Dialoguard.
//!
//! Exposes the health check and the v1 API (blocking and streaming turns,
//! topics and progress). Built on Axum.

pub mod api_v1;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::{Router, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use dialoguard_agent::TurnPipeline;
use dialoguard_config::AppConfig;

/// Request bodies above this size are rejected.
const BODY_LIMIT_BYTES: usize = 1024 * 1024;

/// Build the full router: `/health` plus the v1 API under `/v1`.
///
/// Layers applied:
/// - CORS restricted to the local development origin
/// - Request body size limit (1 MB)
/// - HTTP trace logging
pub fn build_router(pipeline: Arc<TurnPipeline>) -> Router {
    let api_state = Arc::new(api_v1::ApiV1State { pipeline });

    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("http://localhost:8080"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/health", get(health_handler))
        .nest("/v1", api_v1::v1_router(api_state))
        .layer(DefaultBodyLimit::max(BODY_LIMIT_BYTES))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server.
///
/// Provider, store, notifier, topic catalog and keyword matchers are built
/// once here and shared by every request.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let pipeline = Arc::new(TurnPipeline::from_config(&config).await?);
    let topics = pipeline.tracker().catalog().len();
    let app = build_router(pipeline);

    info!(addr = %addr, model = %config.model, topics, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
