//! Application configuration
//!
//! Everything comes from environment variables. Configuration errors at
//! startup are fatal: the caller logs and exits nonzero. An unset
//! `EVENTBUS_URL` selects the in-memory bus backend (single-process
//! development mode); the metadata and columnar store URLs are required.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use super::constants::{
    DEFAULT_FLUSH_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_HOST, DEFAULT_INGRESS_PORT,
    DEFAULT_INSERT_RETRY_BUDGET, DEFAULT_MAX_BODY_BYTES, DEFAULT_REQUEST_TIMEOUT_MS,
    DEFAULT_STREAM_MAXLEN, DEFAULT_SUBSCRIBER_QUEUE_SIZE, ENV_ALLOWED_ORIGINS,
    ENV_BROADCAST_SUBSCRIBER_QUEUE_SIZE, ENV_COLUMNAR_INSERT_RETRY_BUDGET, ENV_COLUMNAR_STORE_URL,
    ENV_EVENTBUS_STREAM_MAXLEN,
    ENV_EVENTBUS_URL, ENV_INGRESS_MAX_BODY_BYTES, ENV_INGRESS_PORT, ENV_INGRESS_REQUEST_TIMEOUT_MS,
    ENV_METADATA_STORE_URL, ENV_PERSIST_SPILL_PATH, ENV_WORKER_BATCH_SIZE,
    ENV_WORKER_FLUSH_INTERVAL_MS,
};
use crate::data::clickhouse::ClickhouseConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} is required but not set")]
    Missing { name: &'static str },
    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// None selects the in-memory backend
    pub redis_url: Option<String>,
    pub stream_maxlen: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub flush_batch_size: usize,
    pub flush_interval: Duration,
    pub insert_retry_budget: u32,
    pub subscriber_queue_size: usize,
    pub spill_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub bus: BusConfig,
    pub metadata_store_url: String,
    pub columnar: ClickhouseConfig,
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::load_from(&env)
    }

    /// Load from an explicit environment map.
    pub fn load_from(env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let server = ServerConfig {
            host: DEFAULT_HOST.to_string(),
            port: parse_or(env, ENV_INGRESS_PORT, DEFAULT_INGRESS_PORT)?,
            max_body_bytes: parse_or(env, ENV_INGRESS_MAX_BODY_BYTES, DEFAULT_MAX_BODY_BYTES)?,
            request_timeout: Duration::from_millis(parse_or(
                env,
                ENV_INGRESS_REQUEST_TIMEOUT_MS,
                DEFAULT_REQUEST_TIMEOUT_MS,
            )?),
            allowed_origins: env
                .get(ENV_ALLOWED_ORIGINS)
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        };

        let bus = BusConfig {
            redis_url: env.get(ENV_EVENTBUS_URL).cloned().filter(|v| !v.is_empty()),
            stream_maxlen: parse_or(env, ENV_EVENTBUS_STREAM_MAXLEN, DEFAULT_STREAM_MAXLEN)?,
        };

        let metadata_store_url = env
            .get(ENV_METADATA_STORE_URL)
            .cloned()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing {
                name: ENV_METADATA_STORE_URL,
            })?;

        let columnar_url = env
            .get(ENV_COLUMNAR_STORE_URL)
            .cloned()
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing {
                name: ENV_COLUMNAR_STORE_URL,
            })?;

        let worker = WorkerConfig {
            flush_batch_size: parse_or(env, ENV_WORKER_BATCH_SIZE, DEFAULT_FLUSH_BATCH_SIZE)?,
            flush_interval: Duration::from_millis(parse_or(
                env,
                ENV_WORKER_FLUSH_INTERVAL_MS,
                DEFAULT_FLUSH_INTERVAL_MS,
            )?),
            insert_retry_budget: parse_or(
                env,
                ENV_COLUMNAR_INSERT_RETRY_BUDGET,
                DEFAULT_INSERT_RETRY_BUDGET,
            )?,
            subscriber_queue_size: parse_or(
                env,
                ENV_BROADCAST_SUBSCRIBER_QUEUE_SIZE,
                DEFAULT_SUBSCRIBER_QUEUE_SIZE,
            )?,
            spill_path: env
                .get(ENV_PERSIST_SPILL_PATH)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
        };

        Ok(Self {
            server,
            bus,
            metadata_store_url,
            columnar: ClickhouseConfig {
                url: columnar_url,
                database: "spanline".to_string(),
                user: None,
                password: None,
            },
            worker,
        })
    }
}

fn parse_or<T>(env: &HashMap<String, String>, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env.get(name).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            value: value.clone(),
            reason: e.to_string(),
        }),
    }
}
