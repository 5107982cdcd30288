//! ClickHouse analytics service
//!
//! Async HTTP connections to ClickHouse with LZ4 compression and batch
//! inserts. The three pipeline workers write here; nothing in the pipeline
//! reads back (aggregations are precomputed, not queried).

pub mod error;
pub mod repositories;
pub mod schema;

pub use error::ClickhouseError;

use clickhouse::Client;

use crate::data::types::{Alert, CostMetric, Span};

/// Connection settings for the columnar store
#[derive(Debug, Clone)]
pub struct ClickhouseConfig {
    pub url: String,
    pub database: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// ClickHouse analytics service
pub struct ClickhouseService {
    client: Client,
}

impl ClickhouseService {
    /// Initialize the connection and apply the schema.
    pub async fn init(config: &ClickhouseConfig) -> Result<Self, ClickhouseError> {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database)
            .with_compression(clickhouse::Compression::Lz4);

        if let Some(ref user) = config.user {
            client = client.with_user(user);
        }
        if let Some(ref password) = config.password {
            client = client.with_password(password);
        }

        let service = Self { client };
        service.run_migrations().await?;

        tracing::debug!(
            url = %config.url,
            database = %config.database,
            "ClickhouseService initialized"
        );

        Ok(service)
    }

    /// Health check - verify connection
    pub async fn health_check(&self) -> Result<(), ClickhouseError> {
        self.client
            .query("SELECT 1")
            .execute()
            .await
            .map_err(ClickhouseError::from)
    }

    /// Bulk-insert spans. Returns only after the insert is durable on the
    /// server; callers acknowledge bus messages on success.
    pub async fn insert_spans(&self, spans: &[Span]) -> Result<(), ClickhouseError> {
        repositories::span::insert_spans(&self.client, spans).await
    }

    /// Bulk-insert alerts.
    pub async fn insert_alerts(&self, alerts: &[Alert]) -> Result<(), ClickhouseError> {
        repositories::alert::insert_alerts(&self.client, alerts).await
    }

    /// Bulk-insert cost metrics.
    pub async fn insert_costs(&self, costs: &[CostMetric]) -> Result<(), ClickhouseError> {
        repositories::cost::insert_costs(&self.client, costs).await
    }

    /// Apply the schema if this database has not seen it yet.
    async fn run_migrations(&self) -> Result<(), ClickhouseError> {
        for ddl in schema::schema_statements() {
            self.client.query(ddl).execute().await.map_err(|e| {
                ClickhouseError::Connection(format!(
                    "failed to apply schema: {e}. Verify ClickHouse is running and accessible."
                ))
            })?;
        }

        let current: Option<i32> = self
            .client
            .query("SELECT version FROM schema_version WHERE id = 1")
            .fetch_optional()
            .await
            .ok()
            .flatten();

        match current {
            Some(v) if v > schema::SCHEMA_VERSION => Err(ClickhouseError::MigrationFailed {
                version: v,
                name: "version_check".to_string(),
                error: format!(
                    "database schema version {} is newer than application version {}",
                    v,
                    schema::SCHEMA_VERSION
                ),
            }),
            Some(_) => Ok(()),
            None => {
                let now = chrono::Utc::now().timestamp();
                self.client
                    .query(
                        "INSERT INTO schema_version (id, version, applied_at, description) VALUES (?, ?, ?, ?)",
                    )
                    .bind(1u8)
                    .bind(schema::SCHEMA_VERSION)
                    .bind(now)
                    .bind("Initial schema")
                    .execute()
                    .await
                    .map_err(ClickhouseError::from)?;
                tracing::debug!(version = schema::SCHEMA_VERSION, "ClickHouse schema applied");
                Ok(())
            }
        }
    }
}
