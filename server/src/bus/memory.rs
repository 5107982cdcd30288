//! In-memory bus backend
//!
//! Local-only stand-in for the Redis Streams backend, with the same
//! consumer-group semantics: per-group cursor, per-group pending list,
//! bulk acknowledgment, idle-claim recovery, approximate length trimming.
//!
//! ## Limitations
//!
//! Suitable for development, tests, and single-process deployments only:
//! a process crash loses all messages. Production deployments use the
//! Redis backend for durability and multi-process coordination.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::backend::{BusBackend, BusMessage, StartPosition, StreamStats};
use super::error::BusError;

/// Message stored in a memory stream
struct StreamEntry {
    id: u64,
    payload: Vec<u8>,
}

/// Per-group delivery state
#[derive(Default)]
struct GroupState {
    /// Highest id handed out to any consumer of the group
    cursor: u64,
    /// Delivered but unacknowledged: id -> (consumer, delivery time)
    pending: BTreeMap<u64, (String, Instant)>,
    /// Consumers that have ever read in this group
    consumers: HashSet<String>,
}

struct StreamState {
    messages: VecDeque<StreamEntry>,
    groups: HashMap<String, GroupState>,
    next_id: u64,
}

impl Default for StreamState {
    fn default() -> Self {
        Self {
            messages: VecDeque::new(),
            groups: HashMap::new(),
            next_id: 1,
        }
    }
}

/// In-memory bus backend
pub struct MemoryBusBackend {
    streams: Mutex<HashMap<String, StreamState>>,
    notifiers: Mutex<HashMap<String, Arc<Notify>>>,
    max_len: u64,
}

impl MemoryBusBackend {
    pub fn new(max_len: u64) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            notifiers: Mutex::new(HashMap::new()),
            max_len,
        }
    }

    fn notifier(&self, stream: &str) -> Arc<Notify> {
        let mut notifiers = self.notifiers.lock();
        Arc::clone(
            notifiers
                .entry(stream.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    /// Trim to the length bound. Evicting entries a group has not finished
    /// with is catastrophic data loss and is logged as such.
    fn trim(stream_name: &str, state: &mut StreamState, max_len: u64) {
        let mut lost = 0u64;
        while state.messages.len() as u64 > max_len {
            let Some(entry) = state.messages.pop_front() else {
                break;
            };
            for group in state.groups.values_mut() {
                if group.pending.remove(&entry.id).is_some() || entry.id > group.cursor {
                    lost += 1;
                }
            }
        }
        if lost > 0 {
            tracing::error!(
                stream = stream_name,
                lost,
                "Stream length bound evicted undelivered or pending messages; data lost"
            );
        }
    }
}

#[async_trait]
impl BusBackend for MemoryBusBackend {
    async fn append(&self, stream: &str, payload: &[u8]) -> Result<String, BusError> {
        let id = {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream.to_string()).or_default();
            let id = state.next_id;
            state.next_id += 1;
            state.messages.push_back(StreamEntry {
                id,
                payload: payload.to_vec(),
            });
            Self::trim(stream, state, self.max_len);
            id
        };

        self.notifier(stream).notify_one();
        Ok(id.to_string())
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block_for: Duration,
    ) -> Result<Vec<BusMessage>, BusError> {
        let deadline = Instant::now() + block_for;
        let notifier = self.notifier(stream);

        loop {
            let batch = {
                let mut streams = self.streams.lock();
                let state = streams.entry(stream.to_string()).or_default();
                let Some(group_state) = state.groups.get_mut(group) else {
                    return Err(BusError::ConsumerGroup(format!(
                        "group '{group}' does not exist on stream '{stream}'"
                    )));
                };

                group_state.consumers.insert(consumer.to_string());

                let now = Instant::now();
                let mut batch = Vec::new();
                for entry in &state.messages {
                    if batch.len() >= max_count {
                        break;
                    }
                    if entry.id > group_state.cursor {
                        group_state.cursor = entry.id;
                        group_state
                            .pending
                            .insert(entry.id, (consumer.to_string(), now));
                        batch.push(BusMessage {
                            id: entry.id.to_string(),
                            payload: entry.payload.clone(),
                        });
                    }
                }
                batch
            };

            if !batch.is_empty() {
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            // notify_one stores a permit, so an append racing this wait is
            // picked up on the next pass instead of being missed.
            let _ = tokio::time::timeout(remaining, notifier.notified()).await;
        }
    }

    async fn acknowledge(
        &self,
        stream: &str,
        group: &str,
        ids: &[String],
    ) -> Result<(), BusError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(());
        };
        for id in ids {
            if let Ok(id) = id.parse::<u64>() {
                group_state.pending.remove(&id);
            }
        }
        Ok(())
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: StartPosition,
    ) -> Result<(), BusError> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Ok(());
        }
        let cursor = match start {
            StartPosition::FromOldest => 0,
            StartPosition::NewOnly => state.next_id - 1,
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                cursor,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<BusMessage>, BusError> {
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let idle_ids: Vec<u64> = group_state
            .pending
            .iter()
            .filter(|(_, (_, delivered_at))| now.duration_since(*delivered_at) >= min_idle)
            .map(|(&id, _)| id)
            .take(count)
            .collect();

        let mut claimed = Vec::new();
        for id in idle_ids {
            match state.messages.iter().find(|e| e.id == id) {
                Some(entry) => {
                    group_state
                        .pending
                        .insert(id, (consumer.to_string(), now));
                    claimed.push(BusMessage {
                        id: id.to_string(),
                        payload: entry.payload.clone(),
                    });
                }
                None => {
                    // Entry evicted while pending: unrecoverable.
                    group_state.pending.remove(&id);
                    tracing::error!(stream, group, id, "Pending message lost to eviction");
                }
            }
        }
        Ok(claimed)
    }

    async fn stats(&self, stream: &str, group: &str) -> Result<StreamStats, BusError> {
        let streams = self.streams.lock();
        let Some(state) = streams.get(stream) else {
            return Ok(StreamStats::default());
        };
        let length = state.messages.len() as u64;
        let Some(group_state) = state.groups.get(group) else {
            return Ok(StreamStats {
                length,
                ..Default::default()
            });
        };
        Ok(StreamStats {
            length,
            pending: group_state.pending.len() as u64,
            consumers: group_state.consumers.len() as u64,
        })
    }

    async fn health_check(&self) -> Result<(), BusError> {
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_append_returns_monotonic_ids() {
        let bus = MemoryBusBackend::new(1000);
        let a = bus.append("s", b"one").await.unwrap();
        let b = bus.append("s", b"two").await.unwrap();
        assert!(a.parse::<u64>().unwrap() < b.parse::<u64>().unwrap());
    }

    #[tokio::test]
    async fn test_read_requires_group() {
        let bus = MemoryBusBackend::new(1000);
        bus.append("s", b"m").await.unwrap();
        let err = bus.read("s", "g", "c", 10, BLOCK).await.unwrap_err();
        assert!(matches!(err, BusError::ConsumerGroup(_)));
    }

    #[tokio::test]
    async fn test_read_delivers_and_tracks_pending() {
        let bus = MemoryBusBackend::new(1000);
        bus.create_group("s", "g", StartPosition::FromOldest)
            .await
            .unwrap();
        bus.append("s", b"m1").await.unwrap();
        bus.append("s", b"m2").await.unwrap();

        let batch = bus.read("s", "g", "c", 10, BLOCK).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, b"m1");

        let stats = bus.stats("s", "g").await.unwrap();
        assert_eq!(stats.pending, 2);

        // Messages are not redelivered to the same group while pending.
        let again = bus.read("s", "g", "c", 10, BLOCK).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_bulk_acknowledge_clears_pending() {
        let bus = MemoryBusBackend::new(1000);
        bus.create_group("s", "g", StartPosition::FromOldest)
            .await
            .unwrap();
        bus.append("s", b"m1").await.unwrap();
        bus.append("s", b"m2").await.unwrap();

        let batch = bus.read("s", "g", "c", 10, BLOCK).await.unwrap();
        let ids: Vec<String> = batch.iter().map(|m| m.id.clone()).collect();
        bus.acknowledge("s", "g", &ids).await.unwrap();

        let stats = bus.stats("s", "g").await.unwrap();
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_each_group_sees_every_message() {
        let bus = MemoryBusBackend::new(1000);
        for group in ["g1", "g2", "g3"] {
            bus.create_group("s", group, StartPosition::FromOldest)
                .await
                .unwrap();
        }
        bus.append("s", b"m").await.unwrap();

        for group in ["g1", "g2", "g3"] {
            let batch = bus.read("s", group, "c", 10, BLOCK).await.unwrap();
            assert_eq!(batch.len(), 1, "group {group} missed the message");
        }
    }

    #[tokio::test]
    async fn test_new_only_group_skips_existing() {
        let bus = MemoryBusBackend::new(1000);
        bus.append("s", b"old").await.unwrap();
        bus.create_group("s", "g", StartPosition::NewOnly)
            .await
            .unwrap();

        assert!(bus.read("s", "g", "c", 10, BLOCK).await.unwrap().is_empty());

        bus.append("s", b"new").await.unwrap();
        let batch = bus.read("s", "g", "c", 10, BLOCK).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"new");
    }

    #[tokio::test]
    async fn test_create_group_idempotent() {
        let bus = MemoryBusBackend::new(1000);
        bus.append("s", b"m").await.unwrap();
        bus.create_group("s", "g", StartPosition::FromOldest)
            .await
            .unwrap();
        let batch = bus.read("s", "g", "c", 10, BLOCK).await.unwrap();
        assert_eq!(batch.len(), 1);

        // Re-creating must not reset the cursor or pending list.
        bus.create_group("s", "g", StartPosition::FromOldest)
            .await
            .unwrap();
        assert!(bus.read("s", "g", "c", 10, BLOCK).await.unwrap().is_empty());
        assert_eq!(bus.stats("s", "g").await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn test_claim_redelivers_idle_pending() {
        let bus = MemoryBusBackend::new(1000);
        bus.create_group("s", "g", StartPosition::FromOldest)
            .await
            .unwrap();
        bus.append("s", b"m").await.unwrap();

        // Delivered to a consumer that never acks.
        let batch = bus.read("s", "g", "crashed", 10, BLOCK).await.unwrap();
        assert_eq!(batch.len(), 1);

        let claimed = bus
            .claim_pending("s", "g", "survivor", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, b"m");

        // Not yet idle again, nothing more to claim.
        let claimed = bus
            .claim_pending("s", "g", "survivor", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_trim_evicts_oldest() {
        let bus = MemoryBusBackend::new(2);
        bus.create_group("s", "g", StartPosition::FromOldest)
            .await
            .unwrap();
        for payload in [b"a".as_slice(), b"b", b"c", b"d"] {
            bus.append("s", payload).await.unwrap();
        }
        let stats = bus.stats("s", "g").await.unwrap();
        assert_eq!(stats.length, 2);

        let batch = bus.read("s", "g", "c", 10, BLOCK).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, b"c");
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let bus = Arc::new(MemoryBusBackend::new(1000));
        bus.create_group("s", "g", StartPosition::FromOldest)
            .await
            .unwrap();

        let reader = Arc::clone(&bus);
        let handle = tokio::spawn(async move {
            reader
                .read("s", "g", "c", 10, Duration::from_secs(5))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.append("s", b"late").await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, b"late");
    }
}
