//! Security alert model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Alert severity, ordered LOW < MEDIUM < HIGH < CRITICAL
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Map a rule score to a severity. Scores below 30 are suppressed.
    pub fn from_score(score: f64) -> Option<Self> {
        match score {
            s if s < 30.0 => None,
            s if s < 50.0 => Some(Self::Low),
            s if s < 75.0 => Some(Self::Medium),
            s if s < 90.0 => Some(Self::High),
            _ => Some(Self::Critical),
        }
    }
}

/// A rule-derived assessment that a span exhibits a threat condition.
///
/// Alerts travel the `alerts.live` stream as JSON for human inspectability
/// and are mirrored into the columnar `security_alerts` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub project_id: String,
    pub trace_id: String,
    pub span_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub score: f64,
    pub description: String,
    pub evidence: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_severity_from_score_bands() {
        assert_eq!(Severity::from_score(0.0), None);
        assert_eq!(Severity::from_score(29.9), None);
        assert_eq!(Severity::from_score(30.0), Some(Severity::Low));
        assert_eq!(Severity::from_score(49.9), Some(Severity::Low));
        assert_eq!(Severity::from_score(50.0), Some(Severity::Medium));
        assert_eq!(Severity::from_score(74.9), Some(Severity::Medium));
        assert_eq!(Severity::from_score(75.0), Some(Severity::High));
        assert_eq!(Severity::from_score(89.9), Some(Severity::High));
        assert_eq!(Severity::from_score(90.0), Some(Severity::Critical));
        assert_eq!(Severity::from_score(100.0), Some(Severity::Critical));
    }

    #[test]
    fn test_alert_json_roundtrip() {
        let alert = Alert {
            id: "a1".to_string(),
            project_id: "p1".to_string(),
            trace_id: "t1".to_string(),
            span_id: "s1".to_string(),
            rule_name: "prompt_injection".to_string(),
            severity: Severity::High,
            score: 80.0,
            description: "injection phrases detected".to_string(),
            evidence: "ignore previous instructions".to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&alert).unwrap();
        assert!(json.contains(r#""severity":"HIGH""#));
        let decoded: Alert = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.rule_name, "prompt_injection");
        assert_eq!(decoded.severity, Severity::High);
    }
}
