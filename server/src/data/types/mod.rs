//! Core pipeline data types
//!
//! Spans are the unit of agent work accepted at the ingress; alerts and cost
//! metrics are derived from them by the stream workers. All three are
//! immutable once produced.

mod alert;
mod cost;
mod span;

pub use alert::{Alert, Severity};
pub use cost::CostMetric;
pub use span::{
    ATTR_LLM_MODEL, ATTR_LLM_TOKENS_IN, ATTR_LLM_TOKENS_OUT, RawSpan, Span, SpanEvent, SpanStatus,
    SpanValidationError, coerce_attribute_value,
};
