//! Shared API types
//!
//! Every error response renders `{"error": "<code>", "detail": "<string>"}`.
//! Unavailable responses carry a `Retry-After` header.

use axum::Json;
use axum::http::{HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};

use crate::core::constants::BACKPRESSURE_RETRY_AFTER_SECS;

/// Standard API error response
#[derive(Debug)]
pub enum ApiError {
    /// Missing, malformed, or unknown API key
    Unauthorized { detail: String },
    /// Undecodable body or no recognizable span objects
    BadRequest { detail: String },
    /// Body larger than the configured ceiling
    PayloadTooLarge { detail: String },
    /// A downstream dependency cannot be reached
    Unavailable { detail: String },
}

impl ApiError {
    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::Unauthorized {
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::BadRequest {
            detail: detail.into(),
        }
    }

    pub fn payload_too_large(detail: impl Into<String>) -> Self {
        Self::PayloadTooLarge {
            detail: detail.into(),
        }
    }

    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::Unavailable {
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            Self::Unauthorized { detail } => (StatusCode::UNAUTHORIZED, "unauthorized", detail),
            Self::BadRequest { detail } => (StatusCode::BAD_REQUEST, "bad_request", detail),
            Self::PayloadTooLarge { detail } => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", detail)
            }
            Self::Unavailable { detail } => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", detail)
            }
        };

        let body = Json(serde_json::json!({
            "error": code,
            "detail": detail,
        }));

        if status == StatusCode::SERVICE_UNAVAILABLE {
            (
                status,
                [(
                    HeaderName::from_static("retry-after"),
                    BACKPRESSURE_RETRY_AFTER_SECS.to_string(),
                )],
                body,
            )
                .into_response()
        } else {
            (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
    }
}
