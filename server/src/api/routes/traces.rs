//! Span ingestion endpoint
//!
//! `POST /v1/traces`: authenticated span intake. The body is read under a
//! hard byte ceiling (the Content-Length header is advisory only), inflated
//! under the same ceiling when gzip encoded, decoded from one of three JSON
//! shapes, validated span by span, tagged with the authoritative project id,
//! and appended to `spans.ingest` one span at a time. Invalid spans are
//! counted and discarded without failing the batch.

use std::io::Read;
use std::time::Instant;

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use flate2::read::MultiGzDecoder;
use serde::Deserialize;

use crate::api::types::ApiError;
use crate::api::ApiState;
use crate::bus::BusError;
use crate::data::keydir::KeyDirectoryError;
use crate::data::types::{RawSpan, Span};

/// Request header carrying the API key
const API_KEY_HEADER: &str = "x-api-key";

/// Maximum in-request attempts per span append
const PUBLISH_MAX_ATTEMPTS: u32 = 3;

/// Base delay in milliseconds for append retry backoff
const PUBLISH_BASE_DELAY_MS: u64 = 50;

/// The three accepted body shapes. Elements stay raw JSON so one malformed
/// span is counted and discarded without rejecting the batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum IngestBody {
    Wrapped { spans: Vec<serde_json::Value> },
    List(Vec<serde_json::Value>),
    Single(serde_json::Value),
}

impl IngestBody {
    fn into_values(self) -> Vec<serde_json::Value> {
        match self {
            Self::Wrapped { spans } => spans,
            Self::List(spans) => spans,
            Self::Single(span) => vec![span],
        }
    }
}

pub async fn ingest(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ApiError> {
    let deadline = Instant::now() + state.config.request_timeout;
    let max_bytes = state.config.max_body_bytes;

    // (1) Read the raw body under the hard ceiling.
    let raw = axum::body::to_bytes(body, max_bytes)
        .await
        .map_err(|_| ApiError::payload_too_large(format!("body exceeds {max_bytes} bytes")))?;

    // (2) Inflate if requested, applying the same ceiling to the output.
    let decoded = if is_gzip(&headers) {
        inflate_limited(&raw, max_bytes)?
    } else {
        raw.to_vec()
    };

    // (3) Decode into one of the three accepted shapes.
    let spans = serde_json::from_slice::<IngestBody>(&decoded)
        .map_err(|e| ApiError::bad_request(format!("undecodable request body: {e}")))?
        .into_values();
    if spans.is_empty() {
        return Err(ApiError::bad_request("no span objects in request"));
    }

    // (4) Resolve the API key once per request.
    let presented_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing X-API-Key header"))?;

    let project_id = match state.keydir.resolve(presented_key).await {
        Ok(project_id) => {
            state.readiness.record_keydir_ok();
            project_id
        }
        Err(KeyDirectoryError::UnknownKey) => {
            return Err(ApiError::unauthorized("invalid API key"));
        }
        Err(KeyDirectoryError::Unavailable(detail)) => {
            tracing::error!(error = %detail, "Key directory unavailable");
            return Err(ApiError::unavailable("authentication backend unavailable"));
        }
    };

    // (5) Validate, tag, and append each span individually.
    let total = spans.len();
    let mut invalid = 0usize;
    let mut queued = 0usize;
    let mut append_errors = 0usize;
    let mut bus_unavailable = false;

    for value in spans {
        if Instant::now() >= deadline {
            tracing::warn!(
                queued,
                remaining = total - queued - invalid - append_errors,
                "Request deadline reached; abandoning remaining appends"
            );
            break;
        }

        let raw_span = match serde_json::from_value::<RawSpan>(value) {
            Ok(raw_span) => raw_span,
            Err(e) => {
                invalid += 1;
                tracing::debug!(error = %e, project_id = %project_id, "Discarding unrecognizable span object");
                continue;
            }
        };

        let span = match raw_span.validate(&project_id) {
            Ok(span) => span,
            Err(e) => {
                invalid += 1;
                tracing::debug!(error = %e, project_id = %project_id, "Discarding invalid span");
                continue;
            }
        };

        match append_with_retry(&state, &span, deadline).await {
            Ok(()) => {
                queued += 1;
            }
            Err(e) => {
                append_errors += 1;
                bus_unavailable = bus_unavailable || e.is_retryable();
                tracing::warn!(
                    error = %e,
                    span_id = %span.span_id,
                    project_id = %project_id,
                    "Span append failed"
                );
            }
        }
    }

    if queued > 0 {
        state.readiness.record_bus_ok();
    }

    tracing::debug!(
        project_id = %project_id,
        total,
        queued,
        invalid,
        append_errors,
        "Ingest request processed"
    );

    // (6) A batch succeeds if at least one span was appended.
    if queued == 0 {
        if bus_unavailable {
            return Err(ApiError::unavailable("event bus unavailable"));
        }
        return Err(ApiError::bad_request(format!(
            "no valid spans in request ({invalid} rejected)"
        )));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "accepted",
            "spans_queued": queued,
        })),
    )
        .into_response())
}

/// Append one span with a short in-request retry for transient bus errors,
/// bounded by the request deadline.
async fn append_with_retry(
    state: &ApiState,
    span: &Span,
    deadline: Instant,
) -> Result<(), BusError> {
    for attempt in 1..=PUBLISH_MAX_ATTEMPTS {
        match state.bus.append_span(span).await {
            Ok(_) => {
                if attempt > 1 {
                    tracing::debug!(attempt, "Span append succeeded after retry");
                }
                return Ok(());
            }
            Err(e) => {
                let delay =
                    std::time::Duration::from_millis(PUBLISH_BASE_DELAY_MS * 2_u64.pow(attempt - 1));
                let out_of_time = Instant::now() + delay >= deadline;
                if !e.is_retryable() || attempt == PUBLISH_MAX_ATTEMPTS || out_of_time {
                    return Err(e);
                }
                tracing::warn!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis(),
                    "Retrying span append after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
    unreachable!("append retry loop always returns")
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("gzip"))
        .unwrap_or(false)
}

/// Streaming gzip inflate with a post-inflation byte ceiling.
fn inflate_limited(compressed: &[u8], max_bytes: usize) -> Result<Vec<u8>, ApiError> {
    let mut decoder = MultiGzDecoder::new(compressed).take(max_bytes as u64 + 1);
    let mut inflated = Vec::new();
    decoder
        .read_to_end(&mut inflated)
        .map_err(|e| ApiError::bad_request(format!("invalid gzip body: {e}")))?;

    if inflated.len() > max_bytes {
        return Err(ApiError::payload_too_large(format!(
            "inflated body exceeds {max_bytes} bytes"
        )));
    }
    Ok(inflated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use argon2::password_hash::{SaltString, rand_core::OsRng};
    use argon2::{Argon2, PasswordHasher};
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use tower::ServiceExt;

    use crate::api::{ApiServerConfig, ApiState, build_router};
    use crate::api::readiness::ReadinessTracker;
    use crate::bus::{EventBus, StartPosition};
    use crate::core::constants::STREAM_SPANS_INGEST;
    use crate::data::keydir::{KeyDirectory, ProjectKeyRecord, ProjectKeyStore};
    use crate::domain::broadcast::BroadcastHub;
    use tokio::sync::watch;

    const KEY: &str = "ak_testkey0123456789abcdef0";
    const BAD_KEY: &str = "ak_badkey_____________________";

    struct OneKeyStore {
        record: ProjectKeyRecord,
    }

    #[async_trait::async_trait]
    impl ProjectKeyStore for OneKeyStore {
        async fn lookup_all_project_keys(
            &self,
        ) -> Result<Vec<ProjectKeyRecord>, crate::data::keydir::KeyDirectoryError> {
            Ok(vec![self.record.clone()])
        }
    }

    fn test_state(max_body_bytes: usize) -> (ApiState, EventBus) {
        let salt = SaltString::generate(&mut OsRng);
        let verifier = Argon2::default()
            .hash_password(KEY.as_bytes(), &salt)
            .unwrap()
            .to_string();

        let bus = EventBus::in_memory(100_000);
        let (_, shutdown_rx) = watch::channel(false);
        let state = ApiState {
            keydir: KeyDirectory::new(Arc::new(OneKeyStore {
                record: ProjectKeyRecord {
                    project_id: "proj_1".to_string(),
                    verifier_hash: verifier,
                },
            })),
            bus: bus.clone(),
            hub: BroadcastHub::new(bus.clone(), 16, Duration::from_millis(20)),
            readiness: ReadinessTracker::new(),
            config: ApiServerConfig {
                max_body_bytes,
                request_timeout: Duration::from_secs(30),
            },
            shutdown_rx,
        };
        (state, bus)
    }

    fn span_json(span_id: &str) -> serde_json::Value {
        serde_json::json!({
            "span_id": span_id,
            "trace_id": "t1",
            "name": "llm.chat",
            "start_time": 1_000_000_000u64,
            "end_time": 1_500_000_000u64,
            "status": "OK",
        })
    }

    fn request(body: Vec<u8>, key: Option<&str>, gzip: bool) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder()
            .method("POST")
            .uri("/v1/traces")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header("X-API-Key", key);
        }
        if gzip {
            builder = builder.header(header::CONTENT_ENCODING, "gzip");
        }
        builder.body(Body::from(body)).unwrap()
    }

    fn gzip_bytes(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_accepts_wrapped_shape() {
        let (state, bus) = test_state(5 * 1024 * 1024);
        bus.create_group(STREAM_SPANS_INGEST, "probe", StartPosition::FromOldest)
            .await
            .unwrap();
        let app = build_router(state);

        let body = serde_json::json!({ "spans": [span_json("s1"), span_json("s2")] });
        let response = app
            .oneshot(request(body.to_string().into_bytes(), Some(KEY), false))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = body_json(response).await;
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["spans_queued"], 2);

        // Spans landed on the bus tagged with the authoritative project.
        let batch = bus
            .read(STREAM_SPANS_INGEST, "probe", "c", 10, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        let span = EventBus::decode_span(&batch[0].payload).unwrap();
        assert_eq!(span.project_id, "proj_1");
    }

    #[tokio::test]
    async fn test_accepts_list_and_single_shapes() {
        let (state, _) = test_state(5 * 1024 * 1024);
        let app = build_router(state);

        let list = serde_json::json!([span_json("s1")]);
        let response = app
            .clone()
            .oneshot(request(list.to_string().into_bytes(), Some(KEY), false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let single = span_json("s2");
        let response = app
            .oneshot(request(single.to_string().into_bytes(), Some(KEY), false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["spans_queued"], 1);
    }

    #[tokio::test]
    async fn test_client_project_id_overridden() {
        let (state, bus) = test_state(5 * 1024 * 1024);
        bus.create_group(STREAM_SPANS_INGEST, "probe", StartPosition::FromOldest)
            .await
            .unwrap();
        let app = build_router(state);

        let mut span = span_json("s1");
        span["project_id"] = serde_json::json!("spoofed_project");
        let response = app
            .oneshot(request(span.to_string().into_bytes(), Some(KEY), false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let batch = bus
            .read(STREAM_SPANS_INGEST, "probe", "c", 10, Duration::from_millis(50))
            .await
            .unwrap();
        let decoded = EventBus::decode_span(&batch[0].payload).unwrap();
        assert_eq!(decoded.project_id, "proj_1");
    }

    #[tokio::test]
    async fn test_missing_key_401() {
        let (state, _) = test_state(5 * 1024 * 1024);
        let app = build_router(state);
        let response = app
            .oneshot(request(span_json("s1").to_string().into_bytes(), None, false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "unauthorized");
    }

    #[tokio::test]
    async fn test_unknown_key_401() {
        let (state, _) = test_state(5 * 1024 * 1024);
        let app = build_router(state);
        let response = app
            .oneshot(request(
                span_json("s1").to_string().into_bytes(),
                Some(BAD_KEY),
                false,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_undecodable_body_400() {
        let (state, _) = test_state(5 * 1024 * 1024);
        let app = build_router(state);
        let response = app
            .oneshot(request(b"not json at all".to_vec(), Some(KEY), false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_all_invalid_spans_400_with_count() {
        let (state, _) = test_state(5 * 1024 * 1024);
        let app = build_router(state);

        // Missing timestamps: each span individually rejected.
        let body = serde_json::json!({ "spans": [
            { "span_id": "s1", "trace_id": "t1" },
            { "span_id": "s2", "trace_id": "t1" },
        ]});
        let response = app
            .oneshot(request(body.to_string().into_bytes(), Some(KEY), false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert!(json["detail"].as_str().unwrap().contains("2 rejected"));
    }

    #[tokio::test]
    async fn test_partial_batch_accepted() {
        let (state, _) = test_state(5 * 1024 * 1024);
        let app = build_router(state);

        let body = serde_json::json!({ "spans": [
            span_json("good"),
            { "span_id": "bad", "trace_id": "t1" },
        ]});
        let response = app
            .oneshot(request(body.to_string().into_bytes(), Some(KEY), false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["spans_queued"], 1);
    }

    #[tokio::test]
    async fn test_type_malformed_span_does_not_reject_batch() {
        let (state, _) = test_state(5 * 1024 * 1024);
        let app = build_router(state);

        let body = serde_json::json!({ "spans": [
            span_json("good"),
            { "span_id": "bad", "trace_id": "t1", "start_time": "not-a-number" },
        ]});
        let response = app
            .oneshot(request(body.to_string().into_bytes(), Some(KEY), false))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["spans_queued"], 1);
    }

    #[tokio::test]
    async fn test_oversize_raw_body_413() {
        let (state, _) = test_state(1024);
        let app = build_router(state);
        let big = vec![b'x'; 2048];
        let response = app.oneshot(request(big, Some(KEY), false)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_gzip_inflation_boundary() {
        // Ceiling sized so the exact-limit body passes and one byte more fails.
        let span = span_json("s1").to_string();
        let padding_target = 4096usize;
        let pad = |extra: usize| {
            // Wrap the span with a filler attribute to hit an exact size.
            let base = format!(
                r#"{{"spans":[{span}],"_pad":"{}"}}"#,
                "y".repeat(extra)
            );
            base.into_bytes()
        };

        // Find the pad size that lands exactly on the ceiling.
        let base_len = pad(0).len();
        let exact = pad(padding_target - base_len);
        assert_eq!(exact.len(), padding_target);

        let (state, _) = test_state(padding_target);
        let app = build_router(state);
        let response = app
            .clone()
            .oneshot(request(gzip_bytes(&exact), Some(KEY), true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED, "exactly at ceiling");

        let over = pad(padding_target - base_len + 1);
        let response = app
            .oneshot(request(gzip_bytes(&over), Some(KEY), true))
            .await
            .unwrap();
        assert_eq!(
            response.status(),
            StatusCode::PAYLOAD_TOO_LARGE,
            "one byte past ceiling"
        );
    }

    #[tokio::test]
    async fn test_invalid_gzip_400() {
        let (state, _) = test_state(5 * 1024 * 1024);
        let app = build_router(state);
        let response = app
            .oneshot(request(b"\x1f\x8bgarbage".to_vec(), Some(KEY), true))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_inflate_limited_boundary() {
        let data = vec![b'a'; 100];
        let compressed = gzip_bytes(&data);
        assert_eq!(inflate_limited(&compressed, 100).unwrap().len(), 100);
        assert!(matches!(
            inflate_limited(&compressed, 99),
            Err(ApiError::PayloadTooLarge { .. })
        ));
    }
}
