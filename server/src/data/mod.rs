//! Data layer: pipeline types, columnar store, key directory

pub mod clickhouse;
pub mod keydir;
pub mod types;

use async_trait::async_trait;

use self::clickhouse::{ClickhouseError, ClickhouseService};
use self::types::{Alert, CostMetric, Span};

/// Columnar analytics store contract used by the stream workers.
///
/// ClickHouse implements it in production; tests substitute in-memory fakes.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn insert_spans(&self, spans: &[Span]) -> Result<(), ClickhouseError>;
    async fn insert_alerts(&self, alerts: &[Alert]) -> Result<(), ClickhouseError>;
    async fn insert_costs(&self, costs: &[CostMetric]) -> Result<(), ClickhouseError>;
    async fn health_check(&self) -> Result<(), ClickhouseError>;
}

#[async_trait]
impl AnalyticsStore for ClickhouseService {
    async fn insert_spans(&self, spans: &[Span]) -> Result<(), ClickhouseError> {
        ClickhouseService::insert_spans(self, spans).await
    }

    async fn insert_alerts(&self, alerts: &[Alert]) -> Result<(), ClickhouseError> {
        ClickhouseService::insert_alerts(self, alerts).await
    }

    async fn insert_costs(&self, costs: &[CostMetric]) -> Result<(), ClickhouseError> {
        ClickhouseService::insert_costs(self, costs).await
    }

    async fn health_check(&self) -> Result<(), ClickhouseError> {
        ClickhouseService::health_check(self).await
    }
}
