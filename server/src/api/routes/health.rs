//! Health and readiness endpoints

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::api::ApiState;

/// `GET /health` - liveness; returns ok whenever the process is up.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `GET /ready` - readiness; 503 unless the key directory and event bus both
/// succeeded recently.
pub async fn ready(State(state): State<ApiState>) -> Response {
    if state.readiness.is_ready() {
        Json(serde_json::json!({ "ready": true })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "ready": false })),
        )
            .into_response()
    }
}
