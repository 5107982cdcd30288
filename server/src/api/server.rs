//! API server initialization

use anyhow::{Context, Result};
use axum::http::{HeaderValue, Method, header};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

use super::{ApiState, build_router};
use crate::core::shutdown::ShutdownService;

pub struct ApiServer {
    state: ApiState,
    host: String,
    port: u16,
    allowed_origins: Vec<String>,
    shutdown: ShutdownService,
}

impl ApiServer {
    pub fn new(
        state: ApiState,
        host: String,
        port: u16,
        allowed_origins: Vec<String>,
        shutdown: ShutdownService,
    ) -> Self {
        Self {
            state,
            host,
            port,
            allowed_origins,
            shutdown,
        }
    }

    /// Bind and serve until the shutdown signal fires.
    pub async fn start(self) -> Result<()> {
        let app = build_router(self.state).layer(cors_layer(&self.allowed_origins));

        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        tracing::info!(addr = %addr, "Ingress listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.shutdown.wait())
            .await
            .context("server error")?;

        Ok(())
    }
}

/// CORS for the browser-facing live endpoint. An empty list keeps the
/// restrictive default; `*` allows any origin.
fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::CONTENT_ENCODING,
            header::HeaderName::from_static("x-api-key"),
        ]);

    if allowed_origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin, "Ignoring unparseable allowed origin");
                None
            }
        })
        .collect();

    layer.allow_origin(origins)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_layer_accepts_origin_lists() {
        // Smoke-check the three configuration shapes build without panicking.
        let _ = cors_layer(&[]);
        let _ = cors_layer(&["*".to_string()]);
        let _ = cors_layer(&[
            "https://dash.example.com".to_string(),
            "\u{7f}bad".to_string(),
        ]);
    }
}
