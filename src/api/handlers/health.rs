//! Health, readiness and metrics handlers

use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::api::error::{ApiError, ErrorCode};
use crate::domain::{AnchorFilter, AnchorStatus};
use crate::metrics::metric_names;
use crate::server::AppState;

/// Response for the basic health check endpoint
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub timestamp: String,
    pub uptime_seconds: u64,
}

/// GET /health - Liveness.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_seconds: state.metrics.uptime_seconds(),
    })
}

/// GET /ready - The ledger store answers queries.
pub async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.ledger.store().tail().await {
        Ok(tail) => Ok(Json(serde_json::json!({
            "status": "ready",
            "database": "connected",
            "tail_id": tail.map(|event| event.id),
        }))),
        Err(e) => {
            tracing::warn!(error = %e, "Readiness check failed");
            Err(ApiError::new(
                ErrorCode::ServiceUnavailable,
                "ledger store unavailable",
            ))
        }
    }
}

/// Sample the queue and anchor gauges; a failed probe leaves the last value.
async fn refresh_gauges(state: &AppState) {
    if let Some(queue) = state.ledger.dead_letters() {
        match queue.stats().await {
            Ok(stats) => {
                state
                    .metrics
                    .set_gauge(metric_names::DEAD_LETTER_ENTRIES, stats.entries as u64)
                    .await
            }
            Err(e) => tracing::warn!(error = %e, "Failed to read dead-letter stats"),
        }
    }

    let pending = AnchorFilter {
        status: Some(AnchorStatus::Pending),
        limit: 0,
        ..Default::default()
    };
    match state.anchors.list(&pending).await {
        Ok((_, total)) => {
            state
                .metrics
                .set_gauge(metric_names::ANCHORS_PENDING, total.max(0) as u64)
                .await
        }
        Err(e) => tracing::warn!(error = %e, "Failed to count pending anchors"),
    }
}

/// GET /metrics - Prometheus text exposition.
pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    refresh_gauges(&state).await;
    let body = state.metrics.to_prometheus().await;
    let mut response = (StatusCode::OK, body).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; version=0.0.4"),
    );
    response
}

/// GET /metrics/json - The same registry as JSON.
pub async fn json_metrics(State(state): State<AppState>) -> Json<serde_json::Value> {
    refresh_gauges(&state).await;
    Json(state.metrics.to_json().await)
}
