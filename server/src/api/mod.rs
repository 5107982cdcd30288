//! API server and routes

pub mod readiness;
pub mod routes;
mod server;
pub mod types;

pub use readiness::ReadinessTracker;
pub use server::ApiServer;

use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::bus::EventBus;
use crate::data::keydir::KeyDirectory;
use crate::domain::broadcast::BroadcastHub;

/// Ingress knobs shared by the handlers
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Hard body ceiling, measured after decompression
    pub max_body_bytes: usize,
    /// Total per-request deadline
    pub request_timeout: Duration,
}

/// State shared by every route handler
#[derive(Clone)]
pub struct ApiState {
    pub keydir: KeyDirectory,
    pub bus: EventBus,
    pub hub: BroadcastHub,
    pub readiness: ReadinessTracker,
    pub config: ApiServerConfig,
    pub shutdown_rx: watch::Receiver<bool>,
}

/// Build the router. The ingest route disables the framework body limit;
/// the handler enforces its own post-inflation ceiling.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route(
            "/v1/traces",
            post(routes::traces::ingest).layer(DefaultBodyLimit::disable()),
        )
        .route("/v1/alerts/live", get(routes::live::live))
        .route("/health", get(routes::health::health))
        .route("/ready", get(routes::health::ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
