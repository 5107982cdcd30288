//! Span model and ingest validation
//!
//! A [`RawSpan`] is whatever the client posted; [`Span`] is the validated,
//! project-tagged record that travels the bus as MessagePack and lands in the
//! columnar store. Validation rejects individual spans, never whole batches.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::constants::{
    SPAN_ATTRIBUTE_VALUE_MAX_BYTES, SPAN_ID_MAX_LENGTH, SPAN_MAX_ATTRIBUTES, SPAN_MAX_EVENTS,
};

/// Attribute key carrying the LLM model name
pub const ATTR_LLM_MODEL: &str = "llm.model";

/// Attribute key carrying the prompt token count
pub const ATTR_LLM_TOKENS_IN: &str = "llm.tokens.in";

/// Attribute key carrying the completion token count
pub const ATTR_LLM_TOKENS_OUT: &str = "llm.tokens.out";

/// Span status reported by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanStatus {
    Ok,
    Error,
    #[default]
    Unset,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Error => "ERROR",
            Self::Unset => "UNSET",
        }
    }

    /// Lenient parse: unknown strings map to UNSET rather than rejecting.
    fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "OK" => Self::Ok,
            "ERROR" => Self::Error,
            _ => Self::Unset,
        }
    }
}

/// A timestamped event attached to a span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp_ns: u64,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// One unit of agent work, validated and tagged with its owning project.
///
/// `project_id` is assigned from the authenticated API key at ingress and is
/// authoritative; any client-supplied value is discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub span_id: String,
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub project_id: String,
    pub name: String,
    pub service_name: String,
    pub status: SpanStatus,
    /// Nanoseconds since epoch
    pub start_time: u64,
    /// Nanoseconds since epoch
    pub end_time: u64,
    pub duration_ms: f64,
    pub attributes: HashMap<String, String>,
    pub events: Vec<SpanEvent>,
}

impl Span {
    /// The LLM model attribute, if this span carries one.
    pub fn llm_model(&self) -> Option<&str> {
        self.attributes.get(ATTR_LLM_MODEL).map(String::as_str)
    }

    /// Read an attribute as an integer. Accepts string digits; missing or
    /// unparseable values read as zero.
    pub fn attribute_as_u64(&self, key: &str) -> u64 {
        self.attributes
            .get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(0)
    }
}

/// Why a posted span was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SpanValidationError {
    #[error("span_id must be a nonempty printable string of at most {SPAN_ID_MAX_LENGTH} chars")]
    InvalidSpanId,
    #[error("trace_id must be a nonempty printable string of at most {SPAN_ID_MAX_LENGTH} chars")]
    InvalidTraceId,
    #[error("start_time and end_time are required")]
    MissingTimestamps,
    #[error("start_time exceeds end_time")]
    TimeInverted,
    #[error("too many attributes (max {SPAN_MAX_ATTRIBUTES})")]
    TooManyAttributes,
    #[error("attribute value exceeds {SPAN_ATTRIBUTE_VALUE_MAX_BYTES} bytes")]
    AttributeValueTooLarge,
    #[error("too many events (max {SPAN_MAX_EVENTS})")]
    TooManyEvents,
}

/// An unvalidated span as posted by a client.
///
/// Attribute values arrive as arbitrary JSON and are coerced to strings;
/// client-supplied `project_id` is accepted by serde and then ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSpan {
    #[serde(default)]
    pub span_id: String,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default)]
    pub parent_span_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub start_time: Option<u64>,
    #[serde(default)]
    pub end_time: Option<u64>,
    #[serde(default)]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub events: Vec<RawSpanEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSpanEvent {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub timestamp_ns: u64,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// Coerce a client-supplied attribute value to its wire form.
///
/// Scalars take their canonical string form; nested arrays and objects are
/// JSON-encoded into the value string.
pub fn coerce_attribute_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= SPAN_ID_MAX_LENGTH
        && id.chars().all(|c| !c.is_control() && !c.is_whitespace())
}

impl RawSpan {
    /// Validate against the span invariants and tag with the authoritative
    /// project. Returns the immutable [`Span`] or the first violated rule.
    pub fn validate(self, project_id: &str) -> Result<Span, SpanValidationError> {
        if !is_valid_id(&self.span_id) {
            return Err(SpanValidationError::InvalidSpanId);
        }
        if !is_valid_id(&self.trace_id) {
            return Err(SpanValidationError::InvalidTraceId);
        }

        let (start_time, end_time) = match (self.start_time, self.end_time) {
            (Some(s), Some(e)) => (s, e),
            _ => return Err(SpanValidationError::MissingTimestamps),
        };
        if start_time > end_time {
            return Err(SpanValidationError::TimeInverted);
        }

        if self.attributes.len() > SPAN_MAX_ATTRIBUTES {
            return Err(SpanValidationError::TooManyAttributes);
        }
        if self.events.len() > SPAN_MAX_EVENTS {
            return Err(SpanValidationError::TooManyEvents);
        }

        let mut attributes = HashMap::with_capacity(self.attributes.len());
        for (key, value) in &self.attributes {
            let coerced = coerce_attribute_value(value);
            if coerced.len() > SPAN_ATTRIBUTE_VALUE_MAX_BYTES {
                return Err(SpanValidationError::AttributeValueTooLarge);
            }
            attributes.insert(key.clone(), coerced);
        }

        let events = self
            .events
            .into_iter()
            .map(|event| SpanEvent {
                name: event.name,
                timestamp_ns: event.timestamp_ns,
                attributes: event
                    .attributes
                    .iter()
                    .map(|(k, v)| (k.clone(), coerce_attribute_value(v)))
                    .collect(),
            })
            .collect();

        // Recompute when absent; the client value is advisory.
        let duration_ms = self
            .duration_ms
            .unwrap_or_else(|| (end_time - start_time) as f64 / 1e6);

        Ok(Span {
            span_id: self.span_id,
            trace_id: self.trace_id,
            parent_span_id: self.parent_span_id.filter(|p| !p.is_empty()),
            project_id: project_id.to_string(),
            name: self.name,
            service_name: self.service_name,
            status: self.status.as_deref().map(SpanStatus::parse).unwrap_or_default(),
            start_time,
            end_time,
            duration_ms,
            attributes,
            events,
        })
    }
}
