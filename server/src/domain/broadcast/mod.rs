//! Broadcast hub
//!
//! Consumes `alerts.live` through its own consumer group and fans each alert
//! out to subscribed long-lived clients, filtered by project. Delivery is
//! best-effort with backpressure: every subscriber owns a bounded queue;
//! when it is full the oldest queued alert is dropped (counted) and the
//! newest enqueued. Slow consumers are never disconnected here - connection
//! lifecycle (pings, write timeouts) belongs to the transport endpoint.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use super::{PoisonTracker, consumer_name};
use crate::bus::{BusError, EventBus, StartPosition};
use crate::core::constants::{GROUP_BROADCAST, STREAM_ALERTS_LIVE};
use crate::data::types::Alert;

/// Messages read per poll cycle
const READ_BATCH_SIZE: usize = 256;

/// Bounded drop-oldest alert queue owned by one subscriber
struct SubscriberQueue {
    queue: Mutex<VecDeque<Alert>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue, evicting the oldest entry when full.
    fn push(&self, alert: Alert) {
        {
            let mut queue = self.queue.lock();
            if queue.len() == self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(alert);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> Alert {
        loop {
            if let Some(alert) = self.queue.lock().pop_front() {
                return alert;
            }
            self.notify.notified().await;
        }
    }
}

struct SubscriberEntry {
    project_filter: Option<String>,
    queue: Arc<SubscriberQueue>,
}

/// A live subscription. Receive alerts with [`Subscription::recv`]; dropping
/// the handle unsubscribes.
pub struct Subscription {
    id: String,
    queue: Arc<SubscriberQueue>,
    hub: BroadcastHub,
}

impl Subscription {
    /// Next alert for this subscriber, waiting if the queue is empty.
    pub async fn recv(&self) -> Alert {
        self.queue.pop().await
    }

    /// Alerts dropped on this subscriber's queue so far.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.id);
    }
}

/// Fan-out hub, cheap to clone.
#[derive(Clone)]
pub struct BroadcastHub {
    bus: EventBus,
    subscribers: Arc<DashMap<String, SubscriberEntry>>,
    queue_size: usize,
    poll_interval: Duration,
}

impl BroadcastHub {
    pub fn new(bus: EventBus, queue_size: usize, poll_interval: Duration) -> Self {
        Self {
            bus,
            subscribers: Arc::new(DashMap::new()),
            queue_size,
            poll_interval,
        }
    }

    /// Register a subscriber. A nonnull `project_filter` restricts delivery
    /// to alerts of that project.
    pub fn subscribe(&self, subscriber_id: &str, project_filter: Option<String>) -> Subscription {
        let queue = Arc::new(SubscriberQueue::new(self.queue_size));
        self.subscribers.insert(
            subscriber_id.to_string(),
            SubscriberEntry {
                project_filter,
                queue: Arc::clone(&queue),
            },
        );
        tracing::debug!(subscriber_id, total = self.subscribers.len(), "Subscriber registered");
        Subscription {
            id: subscriber_id.to_string(),
            queue,
            hub: self.clone(),
        }
    }

    /// Remove a subscriber atomically.
    pub fn unsubscribe(&self, subscriber_id: &str) {
        if self.subscribers.remove(subscriber_id).is_some() {
            tracing::debug!(subscriber_id, total = self.subscribers.len(), "Subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver one alert to every matching subscriber queue.
    fn fan_out(&self, alert: &Alert) {
        let mut delivered = 0usize;
        for entry in self.subscribers.iter() {
            let matches = entry
                .project_filter
                .as_ref()
                .is_none_or(|filter| *filter == alert.project_id);
            if matches {
                entry.queue.push(alert.clone());
                delivered += 1;
            }
        }
        tracing::trace!(alert_id = %alert.id, delivered, "Alert fanned out");
    }

    /// Start the `alerts.live` consumer task. The group starts at new-only:
    /// live dashboards have no use for a replay of historical alerts.
    pub fn start(self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let consumer = consumer_name();
        tokio::spawn(async move {
            self.run(consumer, shutdown_rx).await;
        })
    }

    async fn run(self, consumer: String, mut shutdown_rx: watch::Receiver<bool>) {
        if let Err(e) = self
            .bus
            .create_group(STREAM_ALERTS_LIVE, GROUP_BROADCAST, StartPosition::NewOnly)
            .await
        {
            tracing::error!(error = %e, group = GROUP_BROADCAST, "FATAL: consumer group creation failed");
            std::process::exit(1);
        }

        let mut poison = PoisonTracker::default();

        tracing::debug!(consumer = %consumer, group = GROUP_BROADCAST, "BroadcastHub started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {}
                result = self.bus.read(
                    STREAM_ALERTS_LIVE,
                    GROUP_BROADCAST,
                    &consumer,
                    READ_BATCH_SIZE,
                    self.poll_interval,
                ) => {
                    match result {
                        Ok(batch) => {
                            let mut ack_ids = Vec::with_capacity(batch.len());
                            for msg in &batch {
                                match EventBus::decode_alert(&msg.payload) {
                                    Ok(alert) => {
                                        poison.forget(&msg.id);
                                        self.fan_out(&alert);
                                        ack_ids.push(msg.id.clone());
                                    }
                                    Err(e) => {
                                        if poison.record_failure(&msg.id) {
                                            poison.forget(&msg.id);
                                            if let Err(dlq_err) = self
                                                .bus
                                                .dead_letter(STREAM_ALERTS_LIVE, GROUP_BROADCAST, msg, &e.to_string())
                                                .await
                                            {
                                                tracing::error!(error = %dlq_err, msg_id = %msg.id, "Failed to dead-letter poison alert");
                                            }
                                        } else {
                                            tracing::warn!(error = %e, msg_id = %msg.id, "Undecodable alert payload, leaving pending");
                                        }
                                    }
                                }
                            }
                            if !ack_ids.is_empty()
                                && let Err(e) = self
                                    .bus
                                    .acknowledge(STREAM_ALERTS_LIVE, GROUP_BROADCAST, &ack_ids)
                                    .await
                            {
                                tracing::warn!(error = %e, count = ack_ids.len(), "Bulk acknowledge failed");
                            }
                        }
                        Err(e) => {
                            if matches!(e, BusError::ConsumerGroup(_)) {
                                tracing::warn!(error = %e, "Consumer group lost, recreating");
                                if let Err(ce) = self
                                    .bus
                                    .create_group(STREAM_ALERTS_LIVE, GROUP_BROADCAST, StartPosition::NewOnly)
                                    .await
                                {
                                    tracing::warn!(error = %ce, "Failed to recreate consumer group");
                                }
                            } else {
                                tracing::warn!(error = %e, "Read from alerts.live failed");
                            }
                            tokio::select! {
                                biased;
                                _ = shutdown_rx.changed() => {}
                                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!("BroadcastHub shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::data::types::Severity;

    fn alert(id: &str, project_id: &str) -> Alert {
        Alert {
            id: id.to_string(),
            project_id: project_id.to_string(),
            trace_id: "t1".to_string(),
            span_id: "s1".to_string(),
            rule_name: "prompt_injection".to_string(),
            severity: Severity::High,
            score: 80.0,
            description: "test".to_string(),
            evidence: "test".to_string(),
            created_at: Utc::now(),
        }
    }

    fn hub() -> BroadcastHub {
        BroadcastHub::new(EventBus::in_memory(10_000), 4, Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_fan_out_respects_project_filter() {
        let hub = hub();
        let matching = hub.subscribe("sub1", Some("p1".to_string()));
        let other = hub.subscribe("sub2", Some("p2".to_string()));
        let unfiltered = hub.subscribe("sub3", None);

        hub.fan_out(&alert("a1", "p1"));

        let received = tokio::time::timeout(Duration::from_millis(100), matching.recv())
            .await
            .unwrap();
        assert_eq!(received.id, "a1");

        let all = tokio::time::timeout(Duration::from_millis(100), unfiltered.recv())
            .await
            .unwrap();
        assert_eq!(all.id, "a1");

        assert!(
            tokio::time::timeout(Duration::from_millis(50), other.recv())
                .await
                .is_err(),
            "filtered subscriber must not receive foreign project alerts"
        );
    }

    #[tokio::test]
    async fn test_backpressure_drops_oldest() {
        let hub = hub(); // queue capacity 4
        let sub = hub.subscribe("slow", None);

        for i in 0..10 {
            hub.fan_out(&alert(&format!("a{i}"), "p1"));
        }

        // The most recent 4 survive; 6 dropped.
        assert_eq!(sub.dropped(), 6);
        for expected in ["a6", "a7", "a8", "a9"] {
            let received = tokio::time::timeout(Duration::from_millis(100), sub.recv())
                .await
                .unwrap();
            assert_eq!(received.id, expected);
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_on_drop() {
        let hub = hub();
        {
            let _sub = hub.subscribe("ephemeral", None);
            assert_eq!(hub.subscriber_count(), 1);
        }
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_hub_consumes_alert_stream() {
        let bus = EventBus::in_memory(10_000);
        let hub = BroadcastHub::new(bus.clone(), 16, Duration::from_millis(20));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = hub.clone().start(shutdown_rx);
        let sub = hub.subscribe("dash", Some("p1".to_string()));

        // Let the consumer create its new-only group before publishing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        bus.append_alert(&alert("a1", "p1")).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("alert never delivered");
        assert_eq!(received.id, "a1");

        // Hub acknowledged the message after fan-out.
        tokio::time::timeout(Duration::from_secs(2), async {
            while bus
                .stats(STREAM_ALERTS_LIVE, GROUP_BROADCAST)
                .await
                .unwrap()
                .pending
                != 0
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("alert never acknowledged");

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
