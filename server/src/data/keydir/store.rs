//! Metadata-store backend for the key directory
//!
//! The relational metadata store owns projects, users, and keys; the pipeline
//! only consumes one read-only contract: `lookup_all_project_keys`.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use super::KeyDirectoryError;

/// One project's stored key verifier
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProjectKeyRecord {
    pub project_id: String,
    /// Self-describing PHC string (argon2 family)
    pub verifier_hash: String,
}

/// Read-only lookup contract the metadata store must provide
#[async_trait]
pub trait ProjectKeyStore: Send + Sync {
    async fn lookup_all_project_keys(&self) -> Result<Vec<ProjectKeyRecord>, KeyDirectoryError>;
}

/// PostgreSQL-backed key store
pub struct PostgresKeyStore {
    pool: PgPool,
}

impl PostgresKeyStore {
    /// Connect to the metadata store.
    pub async fn connect(url: &str) -> Result<Self, KeyDirectoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| KeyDirectoryError::Unavailable(e.to_string()))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ProjectKeyStore for PostgresKeyStore {
    async fn lookup_all_project_keys(&self) -> Result<Vec<ProjectKeyRecord>, KeyDirectoryError> {
        sqlx::query_as::<_, ProjectKeyRecord>(
            "SELECT project_id, verifier_hash FROM project_api_keys",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| KeyDirectoryError::Unavailable(e.to_string()))
    }
}
