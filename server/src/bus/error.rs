//! Event bus error types

use thiserror::Error;

/// Error type for event bus operations
#[derive(Debug, Error)]
pub enum BusError {
    /// The backing store cannot be reached or is failing
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
    /// Consumer group operation failed for a reason other than "group exists"
    #[error("consumer group error: {0}")]
    ConsumerGroup(String),
    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The backend was shut down
    #[error("event bus closed")]
    Closed,
    /// Invalid bus configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl BusError {
    /// True when the caller may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<deadpool_redis::PoolError> for BusError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        BusError::Unavailable(err.to_string())
    }
}

impl From<deadpool_redis::redis::RedisError> for BusError {
    fn from(err: deadpool_redis::redis::RedisError) -> Self {
        BusError::Unavailable(err.to_string())
    }
}
