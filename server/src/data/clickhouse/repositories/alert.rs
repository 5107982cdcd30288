//! ClickHouse alert repository

use clickhouse::{Client, Row};
use serde::Serialize;

use super::chrono_to_offset;
use crate::data::clickhouse::ClickhouseError;
use crate::data::types::Alert;

/// Row structure for the `security_alerts` table
#[derive(Row, Serialize)]
struct AlertRow {
    id: String,
    project_id: String,
    trace_id: String,
    span_id: String,
    rule_name: String,
    severity: String,
    score: f64,
    description: String,
    evidence: String,
    #[serde(with = "clickhouse::serde::time::datetime64::micros")]
    created_at: time::OffsetDateTime,
}

impl From<&Alert> for AlertRow {
    fn from(alert: &Alert) -> Self {
        Self {
            id: alert.id.clone(),
            project_id: alert.project_id.clone(),
            trace_id: alert.trace_id.clone(),
            span_id: alert.span_id.clone(),
            rule_name: alert.rule_name.clone(),
            severity: alert.severity.as_str().to_string(),
            score: alert.score,
            description: alert.description.clone(),
            evidence: alert.evidence.clone(),
            created_at: chrono_to_offset(alert.created_at),
        }
    }
}

/// Insert a batch of alerts in a single request.
pub async fn insert_alerts(client: &Client, alerts: &[Alert]) -> Result<(), ClickhouseError> {
    if alerts.is_empty() {
        return Ok(());
    }

    let mut insert = client
        .insert::<AlertRow>("security_alerts")
        .await
        .map_err(ClickhouseError::from)?;
    for alert in alerts {
        insert
            .write(&AlertRow::from(alert))
            .await
            .map_err(ClickhouseError::from)?;
    }
    insert.end().await.map_err(ClickhouseError::from)?;

    tracing::trace!(count = alerts.len(), "Inserted alert batch");
    Ok(())
}
