//! Bus backend trait definition
//!
//! Defines the interface shared by the Redis Streams backend and the
//! in-memory backend used for development and tests. Both provide
//! at-least-once delivery with consumer groups, per-group pending lists,
//! and explicit (bulk) acknowledgment.

use std::time::Duration;

use async_trait::async_trait;

use super::error::BusError;

/// Message received from a stream with its id for acknowledgment
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Opaque id, monotonically increasing within the stream
    pub id: String,
    /// Encoded payload (MessagePack span or JSON alert)
    pub payload: Vec<u8>,
}

/// Where a newly created consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    /// Deliver everything still retained in the stream
    FromOldest,
    /// Deliver only messages appended after group creation
    NewOnly,
}

/// Stream statistics for monitoring and readiness
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    /// Total messages retained in the stream
    pub length: u64,
    /// Messages delivered to the group but not yet acknowledged
    pub pending: u64,
    /// Number of consumers seen in the group
    pub consumers: u64,
}

/// Durable, ordered, keyed stream store with consumer-group semantics.
///
/// Guarantees at-least-once delivery and per-(stream, group) delivery order.
/// Deduplication is NOT provided; consumers must be idempotent or tolerate
/// replay. Streams are bounded approximately; eviction of unacknowledged
/// entries is catastrophic data loss and is logged by the backend.
#[async_trait]
pub trait BusBackend: Send + Sync {
    /// Append a payload atomically, returning its message id.
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, BusError>;

    /// Read up to `max_count` new messages for `(group, consumer)`, blocking
    /// for at most `block_for`. Returns empty on expiry. Delivered messages
    /// join the group's pending list until acknowledged.
    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_for: Duration,
    ) -> Result<Vec<BusMessage>, BusError>;

    /// Remove ids from the group's pending list. Safe to call in bulk;
    /// unknown ids are ignored.
    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        ids: &[String],
    ) -> Result<(), BusError>;

    /// Create a consumer group. Idempotent: an existing group is not an error.
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BusError>;

    /// Claim pending messages idle for at least `min_idle` from other
    /// consumers of the group (crash recovery).
    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<BusMessage>, BusError>;

    /// Stream statistics for the given group.
    async fn stats(&self, stream: &str, group: &str) -> Result<StreamStats, BusError>;

    /// Validate the backing connection.
    async fn health_check(&self) -> Result<(), BusError>;

    /// Backend name for logging.
    fn backend_name(&self) -> &'static str;
}
