//! Static model price table
//!
//! Maps model names to per-1k-token USD prices. Lookup normalizes to
//! lowercase and falls back to stripping a `provider/` prefix. Unknown
//! models cost zero and are logged once per process at DEBUG.

use std::collections::HashSet;
use std::sync::LazyLock;

use parking_lot::Mutex;

/// Per-1k-token pricing for one model
#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
    /// Span kind this model implies (`llm`, `embedding`)
    pub kind: &'static str,
}

const fn llm(prompt: f64, completion: f64) -> ModelPrice {
    ModelPrice {
        prompt_per_1k: prompt,
        completion_per_1k: completion,
        kind: "llm",
    }
}

const fn embedding(prompt: f64) -> ModelPrice {
    ModelPrice {
        prompt_per_1k: prompt,
        completion_per_1k: 0.0,
        kind: "embedding",
    }
}

/// Price table, keyed by lowercase model name
static PRICES: &[(&str, ModelPrice)] = &[
    ("gpt-4", llm(0.03, 0.06)),
    ("gpt-4-32k", llm(0.06, 0.12)),
    ("gpt-4-turbo", llm(0.01, 0.03)),
    ("gpt-4o", llm(0.0025, 0.01)),
    ("gpt-4o-mini", llm(0.00015, 0.0006)),
    ("gpt-3.5-turbo", llm(0.0005, 0.0015)),
    ("o1", llm(0.015, 0.06)),
    ("o1-mini", llm(0.0011, 0.0044)),
    ("claude-3-opus", llm(0.015, 0.075)),
    ("claude-3-sonnet", llm(0.003, 0.015)),
    ("claude-3-haiku", llm(0.00025, 0.00125)),
    ("claude-3-5-sonnet", llm(0.003, 0.015)),
    ("claude-3-5-haiku", llm(0.0008, 0.004)),
    ("gemini-1.5-pro", llm(0.00125, 0.005)),
    ("gemini-1.5-flash", llm(0.000075, 0.0003)),
    ("mistral-large", llm(0.002, 0.006)),
    ("mistral-small", llm(0.0002, 0.0006)),
    ("llama-3.1-70b", llm(0.00088, 0.00088)),
    ("llama-3.1-8b", llm(0.00018, 0.00018)),
    ("text-embedding-ada-002", embedding(0.0001)),
    ("text-embedding-3-small", embedding(0.00002)),
    ("text-embedding-3-large", embedding(0.00013)),
];

static UNKNOWN_LOGGED: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Look up a model's pricing. Tries the lowercase name, then the name with
/// its `provider/` prefix removed.
pub fn lookup(model: &str) -> Option<ModelPrice> {
    let normalized = model.trim().to_ascii_lowercase();

    let find = |key: &str| {
        PRICES
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, price)| *price)
    };

    find(&normalized).or_else(|| {
        normalized
            .split_once('/')
            .and_then(|(_, bare)| find(bare))
    })
}

/// Record an unknown model at DEBUG, once per process.
pub fn log_unknown_model(model: &str) {
    let mut seen = UNKNOWN_LOGGED.lock();
    if seen.insert(model.to_string()) {
        tracing::debug!(model, "Unknown model, recording cost 0");
    }
}

/// `prompt * price_in / 1000 + completion * price_out / 1000`
pub fn compute_cost(price: &ModelPrice, prompt_tokens: u64, completion_tokens: u64) -> f64 {
    prompt_tokens as f64 * price.prompt_per_1k / 1000.0
        + completion_tokens as f64 * price.completion_per_1k / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_exact() {
        let price = lookup("gpt-4").unwrap();
        assert_eq!(price.prompt_per_1k, 0.03);
        assert_eq!(price.completion_per_1k, 0.06);
        assert_eq!(price.kind, "llm");
    }

    #[test]
    fn test_lookup_case_insensitive() {
        assert!(lookup("GPT-4").is_some());
        assert!(lookup("  Claude-3-Opus ").is_some());
    }

    #[test]
    fn test_lookup_provider_prefix() {
        assert!(lookup("openai/gpt-4o").is_some());
        assert!(lookup("anthropic/claude-3-haiku").is_some());
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(lookup("some-internal-model").is_none());
    }

    #[test]
    fn test_embedding_kind() {
        assert_eq!(lookup("text-embedding-3-small").unwrap().kind, "embedding");
    }

    #[test]
    fn test_compute_cost_reference_value() {
        // 100 prompt + 50 completion on gpt-4 = 0.006 USD
        let price = lookup("gpt-4").unwrap();
        let cost = compute_cost(&price, 100, 50);
        assert!((cost - 0.006).abs() <= 1e-9);
    }

    #[test]
    fn test_compute_cost_zero_tokens() {
        let price = lookup("gpt-4").unwrap();
        assert_eq!(compute_cost(&price, 0, 0), 0.0);
    }
}
