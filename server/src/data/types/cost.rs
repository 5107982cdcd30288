//! Cost metric model

use serde::{Deserialize, Serialize};

/// A usage/price record derived from one LLM span.
///
/// `timestamp` is truncated to whole seconds; the columnar table sums
/// numeric fields on identical `(project_id, model, timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostMetric {
    pub project_id: String,
    pub model: String,
    pub span_kind: String,
    /// Seconds since epoch
    pub timestamp: i64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
}
