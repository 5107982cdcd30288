//! ClickHouse cost metric repository

use clickhouse::{Client, Row};
use serde::Serialize;

use crate::data::clickhouse::ClickhouseError;
use crate::data::types::CostMetric;

/// Row structure for the `cost_metrics` table.
///
/// The table is a SummingMergeTree; rows sharing `(project_id, model,
/// timestamp)` have their numeric columns summed at merge time.
#[derive(Row, Serialize)]
struct CostRow {
    project_id: String,
    model: String,
    span_kind: String,
    #[serde(with = "clickhouse::serde::time::datetime")]
    timestamp: time::OffsetDateTime,
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
    cost_usd: f64,
}

impl From<&CostMetric> for CostRow {
    fn from(cost: &CostMetric) -> Self {
        Self {
            project_id: cost.project_id.clone(),
            model: cost.model.clone(),
            span_kind: cost.span_kind.clone(),
            timestamp: time::OffsetDateTime::from_unix_timestamp(cost.timestamp)
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH),
            prompt_tokens: cost.prompt_tokens,
            completion_tokens: cost.completion_tokens,
            total_tokens: cost.total_tokens,
            cost_usd: cost.cost_usd,
        }
    }
}

/// Insert a batch of cost metrics in a single request.
pub async fn insert_costs(client: &Client, costs: &[CostMetric]) -> Result<(), ClickhouseError> {
    if costs.is_empty() {
        return Ok(());
    }

    let mut insert = client
        .insert::<CostRow>("cost_metrics")
        .await
        .map_err(ClickhouseError::from)?;
    for cost in costs {
        insert
            .write(&CostRow::from(cost))
            .await
            .map_err(ClickhouseError::from)?;
    }
    insert.end().await.map_err(ClickhouseError::from)?;

    tracing::trace!(count = costs.len(), "Inserted cost metric batch");
    Ok(())
}
