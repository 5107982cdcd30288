//! Cost aggregator
//!
//! Consumes `spans.ingest` and derives one cost row per LLM span: token
//! counts from the span attributes, prices from the static model table,
//! unknown models recorded at cost zero. Spans without a model attribute
//! are acknowledged and skipped. Batching mirrors the persistence writer:
//! accumulate, flush on size or interval, acknowledge only after the insert
//! is durable, retain the buffer across failures with backed-off retries.

mod pricing;

pub use pricing::{compute_cost, lookup};

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{BatchConfig, PoisonTracker, RecentIds, consumer_name};
use crate::bus::{BusError, BusMessage, EventBus, StartPosition};
use crate::core::constants::{
    CLAIM_INTERVAL_SECS, CLAIM_MAX_COUNT, CLAIM_MIN_IDLE_MS, FLUSH_BACKOFF_BASE_MS,
    FLUSH_BACKOFF_MAX_MS, GROUP_COST, PERSIST_BUFFER_HARD_CAP, PERSIST_DEDUP_RING_SIZE,
    STREAM_SPANS_INGEST,
};
use crate::data::AnalyticsStore;
use crate::data::types::{ATTR_LLM_TOKENS_IN, ATTR_LLM_TOKENS_OUT, CostMetric, Span};
use crate::utils::retry::Backoff;
use crate::utils::time::nanos_to_secs;

pub struct CostAggregator {
    bus: EventBus,
    analytics: Arc<dyn AnalyticsStore>,
    config: BatchConfig,
}

struct CostState {
    rows: Vec<CostMetric>,
    ack_ids: Vec<String>,
    last_flush: Instant,
    backoff: Backoff,
    /// Span identity ring so a re-appended span costs at most once
    dedup: RecentIds,
    poison: PoisonTracker,
}

/// Derive a cost metric from a span, or None for non-LLM spans.
pub fn derive_cost(span: &Span) -> Option<CostMetric> {
    let model = span.llm_model()?.to_string();
    let prompt_tokens = span.attribute_as_u64(ATTR_LLM_TOKENS_IN);
    let completion_tokens = span.attribute_as_u64(ATTR_LLM_TOKENS_OUT);

    let (cost_usd, span_kind) = match pricing::lookup(&model) {
        Some(price) => (
            pricing::compute_cost(&price, prompt_tokens, completion_tokens),
            price.kind.to_string(),
        ),
        None => {
            pricing::log_unknown_model(&model);
            (0.0, span_kind_from_name(&span.name))
        }
    };

    Some(CostMetric {
        project_id: span.project_id.clone(),
        model,
        span_kind,
        timestamp: nanos_to_secs(span.start_time),
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
        cost_usd,
    })
}

/// Span kind from the operation label prefix (`llm.chat` -> `llm`)
fn span_kind_from_name(name: &str) -> String {
    match name.split('.').next() {
        Some(prefix) if !prefix.is_empty() => prefix.to_string(),
        _ => "llm".to_string(),
    }
}

impl CostAggregator {
    pub fn new(bus: EventBus, analytics: Arc<dyn AnalyticsStore>, config: BatchConfig) -> Self {
        Self {
            bus,
            analytics,
            config,
        }
    }

    pub fn start(self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let consumer = consumer_name();
        tokio::spawn(async move {
            self.run(consumer, shutdown_rx).await;
        })
    }

    async fn run(self, consumer: String, mut shutdown_rx: watch::Receiver<bool>) {
        if let Err(e) = self
            .bus
            .create_group(STREAM_SPANS_INGEST, GROUP_COST, StartPosition::FromOldest)
            .await
        {
            tracing::error!(error = %e, group = GROUP_COST, "FATAL: consumer group creation failed");
            std::process::exit(1);
        }

        let mut state = CostState {
            rows: Vec::new(),
            ack_ids: Vec::new(),
            last_flush: Instant::now(),
            backoff: Backoff::new(
                Duration::from_millis(FLUSH_BACKOFF_BASE_MS),
                Duration::from_millis(FLUSH_BACKOFF_MAX_MS),
            ),
            dedup: RecentIds::new(PERSIST_DEDUP_RING_SIZE),
            poison: PoisonTracker::default(),
        };

        let mut claim_interval = tokio::time::interval(Duration::from_secs(CLAIM_INTERVAL_SECS));
        claim_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::debug!(consumer = %consumer, group = GROUP_COST, "CostAggregator started");

        loop {
            if *shutdown_rx.borrow() {
                self.final_flush(&mut state).await;
                break;
            }

            if self.flush_due(&state) {
                self.try_flush(&mut state, &mut shutdown_rx).await;
                continue;
            }

            if state.rows.len() >= PERSIST_BUFFER_HARD_CAP {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => {}
                _ = claim_interval.tick() => {
                    match self
                        .bus
                        .claim_pending(
                            STREAM_SPANS_INGEST,
                            GROUP_COST,
                            &consumer,
                            Duration::from_millis(CLAIM_MIN_IDLE_MS),
                            CLAIM_MAX_COUNT,
                        )
                        .await
                    {
                        Ok(claimed) => {
                            for msg in &claimed {
                                self.buffer_message(&mut state, msg).await;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to claim stuck messages"),
                    }
                }
                result = self.bus.read(
                    STREAM_SPANS_INGEST,
                    GROUP_COST,
                    &consumer,
                    self.config.flush_batch_size,
                    self.config.poll_interval,
                ) => {
                    match result {
                        Ok(batch) => {
                            for msg in &batch {
                                self.buffer_message(&mut state, msg).await;
                            }
                        }
                        Err(e) => {
                            if matches!(e, BusError::ConsumerGroup(_)) {
                                tracing::warn!(error = %e, "Consumer group lost, recreating");
                                if let Err(ce) = self
                                    .bus
                                    .create_group(STREAM_SPANS_INGEST, GROUP_COST, StartPosition::FromOldest)
                                    .await
                                {
                                    tracing::warn!(error = %ce, "Failed to recreate consumer group");
                                }
                            } else {
                                tracing::warn!(error = %e, "Read from spans.ingest failed");
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

        tracing::debug!("CostAggregator shutdown complete");
    }

    async fn buffer_message(&self, state: &mut CostState, msg: &BusMessage) {
        match EventBus::decode_span(&msg.payload) {
            Ok(span) => {
                state.poison.forget(&msg.id);
                if let Some(cost) = derive_cost(&span) {
                    let identity = format!("{}/{}", span.project_id, span.span_id);
                    if state.dedup.insert(&identity) {
                        state.rows.push(cost);
                    } else {
                        tracing::debug!(span_id = %span.span_id, "Duplicate span suppressed from cost metrics");
                    }
                }
                state.ack_ids.push(msg.id.clone());
            }
            Err(e) => {
                if state.poison.record_failure(&msg.id) {
                    state.poison.forget(&msg.id);
                    if let Err(dlq_err) = self
                        .bus
                        .dead_letter(STREAM_SPANS_INGEST, GROUP_COST, msg, &e.to_string())
                        .await
                    {
                        tracing::error!(error = %dlq_err, msg_id = %msg.id, "Failed to dead-letter poison message");
                    }
                } else {
                    tracing::warn!(error = %e, msg_id = %msg.id, "Undecodable span payload, leaving pending");
                }
            }
        }
    }

    fn flush_due(&self, state: &CostState) -> bool {
        if state.rows.len() >= self.config.flush_batch_size {
            return true;
        }
        (!state.rows.is_empty() || !state.ack_ids.is_empty())
            && state.last_flush.elapsed() >= self.config.flush_interval
    }

    async fn try_flush(&self, state: &mut CostState, shutdown_rx: &mut watch::Receiver<bool>) {
        match self.analytics.insert_costs(&state.rows).await {
            Ok(()) => {
                if let Err(e) = self
                    .bus
                    .acknowledge(STREAM_SPANS_INGEST, GROUP_COST, &state.ack_ids)
                    .await
                {
                    tracing::warn!(error = %e, count = state.ack_ids.len(), "Bulk acknowledge failed after durable insert");
                }
                tracing::debug!(rows = state.rows.len(), "Flushed cost batch");
                state.rows.clear();
                state.ack_ids.clear();
                state.backoff.reset();
                state.last_flush = Instant::now();
            }
            Err(e) => {
                let attempts = state.backoff.attempts() + 1;
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    buffered = state.rows.len(),
                    "Cost insert failed; buffer retained"
                );
                if attempts >= self.config.retry_budget {
                    // No spill here: the buffer stays and retries continue at
                    // the backoff ceiling until the store recovers.
                    tracing::warn!(
                        buffered = state.rows.len(),
                        "Cost insert retry budget exhausted; continuing at backoff ceiling"
                    );
                }
                let delay = state.backoff.next_delay();
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn final_flush(&self, state: &mut CostState) {
        if state.rows.is_empty() && state.ack_ids.is_empty() {
            return;
        }
        tracing::debug!(rows = state.rows.len(), "Draining cost buffer before shutdown");

        let mut backoff = Backoff::new(
            Duration::from_millis(FLUSH_BACKOFF_BASE_MS),
            Duration::from_millis(FLUSH_BACKOFF_MAX_MS),
        );
        for _ in 0..self.config.retry_budget {
            match self.analytics.insert_costs(&state.rows).await {
                Ok(()) => {
                    if let Err(e) = self
                        .bus
                        .acknowledge(STREAM_SPANS_INGEST, GROUP_COST, &state.ack_ids)
                        .await
                    {
                        tracing::warn!(error = %e, "Bulk acknowledge failed during drain");
                    }
                    state.rows.clear();
                    state.ack_ids.clear();
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cost flush failed during shutdown drain");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
        tracing::warn!(
            rows = state.rows.len(),
            "Exiting with unflushed cost rows; messages remain pending for redelivery"
        );
    }
}
