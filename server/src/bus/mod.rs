//! Durable event bus
//!
//! An append-only, keyed stream abstraction with consumer-group semantics:
//! at-least-once delivery, per-group cursor, per-consumer pending lists, and
//! explicit bulk acknowledgment. Two named streams carry pipeline traffic:
//! `spans.ingest` (MessagePack-encoded spans) and `alerts.live` (JSON alerts).
//!
//! Backends: Redis Streams for production, in-memory for development and
//! tests, selected by configuration.

mod backend;
mod error;
mod memory;
mod redis;

use std::time::Duration;

use serde::Serialize;
use std::sync::Arc;

pub use backend::{BusBackend, BusMessage, StartPosition, StreamStats};
pub use error::BusError;
pub use memory::MemoryBusBackend;
pub use redis::RedisBusBackend;

use crate::core::constants::{DLQ_SUFFIX, STREAM_ALERTS_LIVE, STREAM_SPANS_INGEST};
use crate::data::types::{Alert, Span};

/// Envelope appended to a `<stream>.dlq` stream for poison messages
#[derive(Debug, Serialize, serde::Deserialize)]
pub struct DeadLetter {
    pub source_stream: String,
    pub group: String,
    pub message_id: String,
    pub reason: String,
    /// Original payload, hex encoded for inspection
    pub payload_hex: String,
}

/// Handle to the event bus, cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    backend: Arc<dyn BusBackend>,
}

impl EventBus {
    /// Connect to the configured backend: Redis Streams when a URL is given,
    /// otherwise the single-process in-memory backend.
    pub async fn connect(redis_url: Option<&str>, stream_maxlen: u64) -> Result<Self, BusError> {
        let backend: Arc<dyn BusBackend> = match redis_url {
            Some(url) => Arc::new(RedisBusBackend::new(url, stream_maxlen).await?),
            None => Arc::new(MemoryBusBackend::new(stream_maxlen)),
        };
        Ok(Self { backend })
    }

    /// In-memory bus for tests and single-process development.
    pub fn in_memory(stream_maxlen: u64) -> Self {
        Self {
            backend: Arc::new(MemoryBusBackend::new(stream_maxlen)),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    // ========================================================================
    // Typed appends and decodes
    // ========================================================================

    /// Append one span to `spans.ingest` as MessagePack.
    pub async fn append_span(&self, span: &Span) -> Result<String, BusError> {
        let payload =
            rmp_serde::to_vec_named(span).map_err(|e| BusError::Serialization(e.to_string()))?;
        self.backend.append(STREAM_SPANS_INGEST, &payload).await
    }

    /// Append one alert to `alerts.live` as JSON (human inspectable).
    pub async fn append_alert(&self, alert: &Alert) -> Result<String, BusError> {
        let payload =
            serde_json::to_vec(alert).map_err(|e| BusError::Serialization(e.to_string()))?;
        self.backend.append(STREAM_ALERTS_LIVE, &payload).await
    }

    /// Decode a `spans.ingest` payload.
    pub fn decode_span(payload: &[u8]) -> Result<Span, BusError> {
        rmp_serde::from_slice(payload).map_err(|e| BusError::Serialization(e.to_string()))
    }

    /// Decode an `alerts.live` payload.
    pub fn decode_alert(payload: &[u8]) -> Result<Alert, BusError> {
        serde_json::from_slice(payload).map_err(|e| BusError::Serialization(e.to_string()))
    }

    // ========================================================================
    // Consumer-group operations
    // ========================================================================

    pub async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_for: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        self.backend
            .read(stream, group, consumer, max_count, block_for)
            .await
    }

    pub async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        ids: &[String],
    ) -> Result<(), BusError> {
        self.backend.acknowledge(stream, group, ids).await
    }

    pub async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BusError> {
        self.backend.create_group(stream, group, start).await
    }

    pub async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        self.backend
            .claim_pending(stream, group, consumer, min_idle, count)
            .await
    }

    pub async fn stats(&self, stream: &str, group: &str) -> Result<StreamStats, BusError> {
        self.backend.stats(stream, group).await
    }

    pub async fn health_check(&self) -> Result<(), BusError> {
        self.backend.health_check().await
    }

    // ========================================================================
    // Dead letters
    // ========================================================================

    /// Acknowledge-and-forward a poison message to the source stream's
    /// dead-letter stream with the failure reason.
    pub async fn dead_letter(
        &self,
        stream: &str,
        group: &str,
        message: &BusMessage,
        reason: &str,
    ) -> Result<(), BusError> {
        let envelope = DeadLetter {
            source_stream: stream.to_string(),
            group: group.to_string(),
            message_id: message.id.clone(),
            reason: reason.to_string(),
            payload_hex: hex::encode(&message.payload),
        };
        let payload =
            serde_json::to_vec(&envelope).map_err(|e| BusError::Serialization(e.to_string()))?;

        let dlq_stream = format!("{stream}{DLQ_SUFFIX}");
        self.backend.append(&dlq_stream, &payload).await?;
        self.backend
            .acknowledge(stream, group, std::slice::from_ref(&message.id))
            .await?;

        tracing::warn!(
            stream,
            group,
            message_id = %message.id,
            reason,
            "Message dead-lettered"
        );
        Ok(())
    }
}
