//! Scrape server.
//!
//! Routes:
//! - `GET /healthz` liveness probe
//! - `GET /metrics` runs one collection cycle and renders exposition text
//! - `GET /api/self-metrics` JSON snapshot of the agent's own counters
//! - `GET /api/collectors` registered collectors

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};

use crate::agent::Agent;
use crate::collector::CollectorInfo;
use crate::exporter::prometheus;
use crate::self_metrics::SelfMetricsSnapshot;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub agent: Arc<Agent>,
    /// Root shutdown token; scrapes stop when it fires.
    pub cancel: CancellationToken,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    collectors: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

/// Create the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/self-metrics", get(self_metrics_handler))
        .route("/api/collectors", get(collectors_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        collectors: state.agent.scheduler().registry().collector_count(),
    })
}

/// Prometheus scrape: one cycle per request.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.agent.collect_once(&state.cancel).await {
        Ok(report) if report.is_cancelled() => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "shutting_down",
                message: "collection cancelled".to_string(),
            }),
        )
            .into_response(),
        Ok(report) => (
            [(header::CONTENT_TYPE, prometheus::CONTENT_TYPE)],
            prometheus::render(&report.measurements),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(reason = e.reason_code(), error = %e, "Scrape failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.reason_code(),
                    message: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

async fn self_metrics_handler(State(state): State<Arc<AppState>>) -> Json<SelfMetricsSnapshot> {
    Json(state.agent.metrics().snapshot())
}

async fn collectors_handler(State(state): State<Arc<AppState>>) -> Json<Vec<CollectorInfo>> {
    Json(state.agent.scheduler().registry().list())
}
