//! Key directory: API key -> authoritative project id
//!
//! Resolution is two-tier. The fast path looks up `SHA-256(presented_key)`
//! in a process-wide cache. The slow path verifies the key against each
//! project's stored password verifier (argon2 PHC string) and runs at most
//! once per distinct key per process lifetime: both hits and misses are
//! cached, misses with a short TTL so rotated keys become visible.
//!
//! Keys that fail the format pre-check are rejected without touching the
//! cache or the metadata store.

mod store;

use std::sync::Arc;
use std::time::Duration;

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use thiserror::Error;

pub use store::{PostgresKeyStore, ProjectKeyRecord, ProjectKeyStore};

use crate::core::constants::{
    API_KEY_MAX_LENGTH, API_KEY_MIN_LENGTH, API_KEY_PREFIX, KEYDIR_CACHE_CAPACITY,
    KEYDIR_NEGATIVE_TTL_SECS,
};
use crate::utils::crypto::sha256_hex;

/// Key directory resolution error
#[derive(Debug, Error)]
pub enum KeyDirectoryError {
    /// Malformed or unrecognized key. Maps to HTTP 401, never retried.
    #[error("unknown api key")]
    UnknownKey,
    /// The metadata store cannot be reached. Maps to HTTP 503, never 401.
    #[error("metadata store unavailable: {0}")]
    Unavailable(String),
}

/// Check the `ak_` + >=24 printable characters format without any lookup.
pub fn is_valid_key_format(key: &str) -> bool {
    key.len() >= API_KEY_MIN_LENGTH
        && key.len() <= API_KEY_MAX_LENGTH
        && key.starts_with(API_KEY_PREFIX)
        && key[API_KEY_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_graphic())
}

/// Process-wide key resolver, cheap to clone.
#[derive(Clone)]
pub struct KeyDirectory {
    store: Arc<dyn ProjectKeyStore>,
    /// sha256(key) -> project_id, kept for the process lifetime
    positive: moka::future::Cache<String, String>,
    /// sha256(key) -> (), expires so key rotation becomes visible
    negative: moka::future::Cache<String, ()>,
}

impl KeyDirectory {
    pub fn new(store: Arc<dyn ProjectKeyStore>) -> Self {
        Self {
            store,
            positive: moka::future::Cache::builder()
                .max_capacity(KEYDIR_CACHE_CAPACITY)
                .build(),
            negative: moka::future::Cache::builder()
                .max_capacity(KEYDIR_CACHE_CAPACITY)
                .time_to_live(Duration::from_secs(KEYDIR_NEGATIVE_TTL_SECS))
                .build(),
        }
    }

    /// Map a presented key to its project id.
    pub async fn resolve(&self, presented_key: &str) -> Result<String, KeyDirectoryError> {
        if !is_valid_key_format(presented_key) {
            return Err(KeyDirectoryError::UnknownKey);
        }

        let key_hash = sha256_hex(presented_key);

        if let Some(project_id) = self.positive.get(&key_hash).await {
            return Ok(project_id);
        }
        if self.negative.get(&key_hash).await.is_some() {
            return Err(KeyDirectoryError::UnknownKey);
        }

        // Slow path: verify against every stored project verifier.
        let records = self.store.lookup_all_project_keys().await?;
        let key = presented_key.to_string();
        let matched = tokio::task::spawn_blocking(move || verify_against(&key, &records))
            .await
            .map_err(|e| KeyDirectoryError::Unavailable(format!("verifier task failed: {e}")))?;

        match matched {
            Some(project_id) => {
                self.positive.insert(key_hash, project_id.clone()).await;
                Ok(project_id)
            }
            None => {
                self.negative.insert(key_hash, ()).await;
                Err(KeyDirectoryError::UnknownKey)
            }
        }
    }

    /// Validate the metadata store connection (readiness probe).
    pub async fn health_check(&self) -> Result<(), KeyDirectoryError> {
        self.store.lookup_all_project_keys().await.map(|_| ())
    }
}

/// CPU-bound argon2 verification over all stored verifiers.
fn verify_against(key: &str, records: &[ProjectKeyRecord]) -> Option<String> {
    let argon2 = Argon2::default();
    for record in records {
        let Ok(parsed) = PasswordHash::new(&record.verifier_hash) else {
            tracing::warn!(
                project_id = %record.project_id,
                "Stored key verifier is not a valid PHC string, skipping"
            );
            continue;
        };
        if argon2.verify_password(key.as_bytes(), &parsed).is_ok() {
            return Some(record.project_id.clone());
        }
    }
    None
}
