//! ClickHouse error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClickhouseError {
    #[error("clickhouse connection error: {0}")]
    Connection(String),
    #[error("clickhouse query error: {0}")]
    Query(String),
    #[error("clickhouse schema migration v{version} ({name}) failed: {error}")]
    MigrationFailed {
        version: i32,
        name: String,
        error: String,
    },
}

impl From<clickhouse::error::Error> for ClickhouseError {
    fn from(err: clickhouse::error::Error) -> Self {
        ClickhouseError::Query(err.to_string())
    }
}
