use axum::{
    extract::State,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::core::metrics;
use crate::core::state::AppState;
use crate::repositories::health;

pub(crate) async fn worker_health(State(state): State<AppState>) -> Response {
    let report = health::check_worker(state.db(), state.queue()).await;
    let status =
        if report.is_healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    if !report.is_healthy() {
        tracing::warn!(checks = ?report.checks, "Worker health check degraded");
    }

    let mut response = (status, Json(report)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("private, no-store"));
    response
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    if !state.settings().telemetry().prometheus_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    match metrics::render() {
        Some(body) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
