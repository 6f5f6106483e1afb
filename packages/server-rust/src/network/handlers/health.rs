//! Health, liveness, readiness, and metrics endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::crash::HealthState;

/// Returns detailed health information as JSON.
///
/// Always returns 200; the `state` field says whether the server is
/// accepting sessions.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let lockdown = &state.lockdown;
    Json(json!({
        "state": lockdown.health_state().as_str(),
        "locked_down": lockdown.is_locked_down(),
        "lockdown_reason": lockdown.lockdown_reason(),
        "sessions": lockdown.active_sessions(),
        "workers": state.config.workers,
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

/// Liveness probe. Always 200 while the process can answer.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 only in the `Ready` state. Starting, lockdown and
/// stopped all answer 503 so no new traffic is routed here.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.lockdown.health_state() == HealthState::Ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus text exposition.
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
