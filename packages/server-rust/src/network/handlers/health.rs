//! Health, liveness and readiness probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;
use tracing::warn;

use super::AppState;

/// Detailed health as JSON. Always 200; the body carries the state.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store = match state.store.ping().await {
        Ok(()) => "ok",
        Err(_) => "unavailable",
    };
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "connections": state.rooms.registry().count(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "shared_store": store,
    }))
}

/// Liveness only says the process answers. Dependencies are not checked so
/// a store outage never restarts the pod.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// 200 when ready and the shared store answers, 503 otherwise.
///
/// Rate limiting and cache coherence both depend on the shared store, so an
/// instance that cannot reach it is taken out of rotation.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if !state.shutdown.health_state().accepts_traffic() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    match state.store.ping().await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            warn!(error = %e, "readiness probe failed: shared store unreachable");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
