//! ClickHouse span repository
//!
//! High-throughput batch writes for validated spans.

use chrono::Utc;
use clickhouse::{Client, Row};
use serde::Serialize;

use super::nanos_to_offset;
use crate::data::clickhouse::ClickhouseError;
use crate::data::types::Span;

/// Row structure for the `agent_spans` table
#[derive(Row, Serialize)]
struct SpanRow {
    span_id: String,
    trace_id: String,
    parent_span_id: Option<String>,
    project_id: String,
    name: String,
    service_name: String,
    status: String,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    start_time: time::OffsetDateTime,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    end_time: time::OffsetDateTime,
    duration_ms: f64,
    attributes: Vec<(String, String)>,
    events: String,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    ingested_at: time::OffsetDateTime,
}

impl From<&Span> for SpanRow {
    fn from(span: &Span) -> Self {
        if span.project_id.is_empty() {
            tracing::warn!(
                trace_id = %span.trace_id,
                span_id = %span.span_id,
                "Inserting span with empty project_id - data isolation may be compromised"
            );
        }

        Self {
            span_id: span.span_id.clone(),
            trace_id: span.trace_id.clone(),
            parent_span_id: span.parent_span_id.clone(),
            project_id: span.project_id.clone(),
            name: span.name.clone(),
            service_name: span.service_name.clone(),
            status: span.status.as_str().to_string(),
            start_time: nanos_to_offset(span.start_time),
            end_time: nanos_to_offset(span.end_time),
            duration_ms: span.duration_ms,
            attributes: span
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            events: serde_json::to_string(&span.events).unwrap_or_else(|_| "[]".to_string()),
            ingested_at: super::chrono_to_offset(Utc::now()),
        }
    }
}

/// Insert a batch of spans in a single request.
pub async fn insert_spans(client: &Client, spans: &[Span]) -> Result<(), ClickhouseError> {
    if spans.is_empty() {
        return Ok(());
    }

    let mut insert = client.insert::<SpanRow>("agent_spans").await.map_err(ClickhouseError::from)?;
    for span in spans {
        insert
            .write(&SpanRow::from(span))
            .await
            .map_err(ClickhouseError::from)?;
    }
    insert.end().await.map_err(ClickhouseError::from)?;

    tracing::trace!(count = spans.len(), "Inserted span batch");
    Ok(())
}
