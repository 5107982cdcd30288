//! Security rule pipeline
//!
//! Rules are applied in a fixed order; each rule contributes zero or more
//! hits for a span, and hits within one rule family fold into at most one
//! alert. Scores cap at 100 and map to severities, with scores below 30
//! suppressed entirely.

use std::collections::HashMap;
use std::sync::LazyLock;

use parking_lot::Mutex;
use regex::RegexSet;

use super::outlier::RollingStats;
use super::pii;
use crate::core::constants::ALERT_EVIDENCE_MAX_CHARS;
use crate::data::types::{
    ATTR_LLM_TOKENS_IN, ATTR_LLM_TOKENS_OUT, Alert, Severity, Span,
};

/// One rule match against a span
#[derive(Debug, Clone)]
pub struct RuleHit {
    pub rule_name: &'static str,
    pub score: f64,
    pub description: String,
    /// Offending value, unmasked; masking happens at alert construction
    pub evidence: String,
}

/// A detection rule applied to every span
pub trait SecurityRule: Send + Sync {
    /// Family name for folding hits into one alert
    fn family(&self) -> &'static str;

    fn apply(&self, span: &Span) -> Vec<RuleHit>;
}

/// The standard pipeline, in application order.
pub fn default_rules() -> Vec<Box<dyn SecurityRule>> {
    vec![
        Box::new(InjectionRule),
        Box::new(PiiRule),
        Box::new(DurationOutlierRule::default()),
        Box::new(TokenExplosionRule),
    ]
}

/// Apply every rule and fold hits into alerts (one per rule family).
pub fn build_alerts(span: &Span, rules: &[Box<dyn SecurityRule>]) -> Vec<Alert> {
    let mut alerts = Vec::new();

    for rule in rules {
        let hits = rule.apply(span);
        if hits.is_empty() {
            continue;
        }

        let score = hits.iter().map(|h| h.score).sum::<f64>().min(100.0);
        let Some(severity) = Severity::from_score(score) else {
            continue;
        };

        let description = hits
            .iter()
            .map(|h| h.description.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let evidence = truncate_chars(
            &pii::mask(&hits[0].evidence),
            ALERT_EVIDENCE_MAX_CHARS,
        );

        alerts.push(Alert {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: span.project_id.clone(),
            trace_id: span.trace_id.clone(),
            span_id: span.span_id.clone(),
            rule_name: hits[0].rule_name.to_string(),
            severity,
            score,
            description,
            evidence,
            created_at: chrono::Utc::now(),
        });
    }

    alerts
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

// ============================================================================
// INJECTION
// ============================================================================

/// Curated injection phrases, matched case-insensitively
const INJECTION_PHRASES: &[&str] = &[
    "ignore previous instructions",
    "disregard the above",
    "DAN mode",
    "developer mode",
    "you are now",
    "system prompt",
    "roleplay as",
];

static INJECTION_SET: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new(
        INJECTION_PHRASES
            .iter()
            .map(|p| format!("(?i){}", regex::escape(p))),
    )
    .expect("valid phrase set")
});

/// Injection phrases across the span name and all attribute values.
/// +40 per distinct phrase, capped at 100.
pub struct InjectionRule;

impl SecurityRule for InjectionRule {
    fn family(&self) -> &'static str {
        "prompt_injection"
    }

    fn apply(&self, span: &Span) -> Vec<RuleHit> {
        let mut matched_phrases: Vec<usize> = Vec::new();
        let mut first_evidence: Option<&str> = None;

        let values = std::iter::once(span.name.as_str())
            .chain(span.attributes.values().map(String::as_str));
        for value in values {
            let matches = INJECTION_SET.matches(value);
            if matches.iter().next().is_some() && first_evidence.is_none() {
                first_evidence = Some(value);
            }
            for idx in matches {
                if !matched_phrases.contains(&idx) {
                    matched_phrases.push(idx);
                }
            }
        }

        let Some(evidence) = first_evidence else {
            return Vec::new();
        };

        matched_phrases
            .into_iter()
            .map(|idx| RuleHit {
                rule_name: "prompt_injection",
                score: 40.0,
                description: format!("injection phrase \"{}\"", INJECTION_PHRASES[idx]),
                evidence: evidence.to_string(),
            })
            .collect()
    }
}

// ============================================================================
// PII
// ============================================================================

/// Structured PII in attribute values. +60 per distinct kind, capped at 100.
pub struct PiiRule;

impl SecurityRule for PiiRule {
    fn family(&self) -> &'static str {
        "pii"
    }

    fn apply(&self, span: &Span) -> Vec<RuleHit> {
        let mut seen: Vec<pii::PiiKind> = Vec::new();
        let mut hits = Vec::new();

        for value in span.attributes.values() {
            for kind in pii::scan(value) {
                if seen.contains(&kind) {
                    continue;
                }
                seen.push(kind);
                hits.push(RuleHit {
                    rule_name: kind.rule_name(),
                    score: 60.0,
                    description: format!("{} detected", kind.label()),
                    evidence: value.clone(),
                });
            }
        }

        hits
    }
}

// ============================================================================
// DURATION OUTLIER
// ============================================================================

/// Per-name rolling duration statistics; flags spans beyond three standard
/// deviations once enough samples exist. Fixed score 50.
#[derive(Default)]
pub struct DurationOutlierRule {
    stats: Mutex<HashMap<String, RollingStats>>,
}

impl SecurityRule for DurationOutlierRule {
    fn family(&self) -> &'static str {
        "duration_outlier"
    }

    fn apply(&self, span: &Span) -> Vec<RuleHit> {
        let mut stats = self.stats.lock();
        let entry = stats.entry(span.name.clone()).or_default();

        // Compare against history excluding this span, then record it.
        let outlier = entry.is_outlier(span.duration_ms);
        let (mean, stddev) = (entry.mean(), entry.stddev());
        entry.push(span.duration_ms);

        if !outlier {
            return Vec::new();
        }

        vec![RuleHit {
            rule_name: "duration_outlier",
            score: 50.0,
            description: format!(
                "duration {:.1} ms exceeds mean {:.1} ms + 3 sigma ({:.1} ms) for \"{}\"",
                span.duration_ms, mean, stddev, span.name
            ),
            evidence: format!("duration_ms={:.1}", span.duration_ms),
        }]
    }
}

// ============================================================================
// TOKEN EXPLOSION
// ============================================================================

/// Combined token usage above 50,000. Fixed score 70.
pub struct TokenExplosionRule;

/// Combined prompt+completion tokens above this trip the rule
const TOKEN_EXPLOSION_THRESHOLD: u64 = 50_000;

impl SecurityRule for TokenExplosionRule {
    fn family(&self) -> &'static str {
        "token_explosion"
    }

    fn apply(&self, span: &Span) -> Vec<RuleHit> {
        let tokens_in = span.attribute_as_u64(ATTR_LLM_TOKENS_IN);
        let tokens_out = span.attribute_as_u64(ATTR_LLM_TOKENS_OUT);
        let total = tokens_in + tokens_out;

        if total <= TOKEN_EXPLOSION_THRESHOLD {
            return Vec::new();
        }

        vec![RuleHit {
            rule_name: "token_explosion",
            score: 70.0,
            description: format!(
                "combined token usage {total} exceeds {TOKEN_EXPLOSION_THRESHOLD}"
            ),
            evidence: format!("tokens_in={tokens_in} tokens_out={tokens_out}"),
        }]
    }
}
