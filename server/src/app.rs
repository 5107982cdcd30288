//! Core application
//!
//! Wires configuration, the event bus, the key directory, the columnar
//! store, the four stream workers, and the HTTP surface together, then
//! serves until a shutdown signal drains everything.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::api::{ApiServer, ApiServerConfig, ApiState, ReadinessTracker};
use crate::bus::EventBus;
use crate::core::config::AppConfig;
use crate::core::constants::{APP_NAME_LOWER, DEFAULT_POLL_INTERVAL_MS, ENV_LOG};
use crate::core::shutdown::ShutdownService;
use crate::data::AnalyticsStore;
use crate::data::clickhouse::ClickhouseService;
use crate::data::keydir::{KeyDirectory, PostgresKeyStore};
use crate::domain::BatchConfig;
use crate::domain::broadcast::BroadcastHub;
use crate::domain::cost::CostAggregator;
use crate::domain::persist::PersistenceWriter;
use crate::domain::security::{SecurityAnalyzer, default_rules};

/// Interval between background readiness probes
const READINESS_PROBE_INTERVAL: Duration = Duration::from_secs(10);

pub struct CoreApp;

impl CoreApp {
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let config = AppConfig::load().context("configuration error")?;

        let shutdown = ShutdownService::new();
        shutdown.install_signal_handlers();

        // Backing services
        let bus = EventBus::connect(config.bus.redis_url.as_deref(), config.bus.stream_maxlen)
            .await
            .context("failed to initialize event bus")?;
        tracing::debug!(backend = bus.backend_name(), "Event bus initialized");

        let keydir = KeyDirectory::new(Arc::new(
            PostgresKeyStore::connect(&config.metadata_store_url)
                .await
                .context("failed to connect to metadata store")?,
        ));

        let analytics: Arc<dyn AnalyticsStore> = Arc::new(
            ClickhouseService::init(&config.columnar)
                .await
                .context("failed to initialize columnar store")?,
        );

        let readiness = ReadinessTracker::new();
        let hub = BroadcastHub::new(
            bus.clone(),
            config.worker.subscriber_queue_size,
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        );

        // Stream workers
        let batch_config = BatchConfig {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            flush_batch_size: config.worker.flush_batch_size,
            flush_interval: config.worker.flush_interval,
            retry_budget: config.worker.insert_retry_budget,
        };

        shutdown
            .register(
                PersistenceWriter::new(
                    bus.clone(),
                    Arc::clone(&analytics),
                    batch_config.clone(),
                    config.worker.spill_path.clone(),
                )
                .start(shutdown.subscribe()),
            )
            .await;

        shutdown
            .register(
                SecurityAnalyzer::new(
                    bus.clone(),
                    Arc::clone(&analytics),
                    default_rules(),
                    batch_config.poll_interval,
                )
                .start(shutdown.subscribe()),
            )
            .await;

        shutdown
            .register(
                CostAggregator::new(bus.clone(), Arc::clone(&analytics), batch_config.clone())
                    .start(shutdown.subscribe()),
            )
            .await;

        shutdown
            .register(hub.clone().start(shutdown.subscribe()))
            .await;

        shutdown
            .register(Self::start_readiness_probe(
                keydir.clone(),
                bus.clone(),
                readiness.clone(),
                shutdown.subscribe(),
            ))
            .await;

        tracing::debug!("Background workers started");

        // HTTP surface
        let state = ApiState {
            keydir,
            bus,
            hub,
            readiness,
            config: ApiServerConfig {
                max_body_bytes: config.server.max_body_bytes,
                request_timeout: config.server.request_timeout,
            },
            shutdown_rx: shutdown.subscribe(),
        };

        let server = ApiServer::new(
            state,
            config.server.host.clone(),
            config.server.port,
            config.server.allowed_origins.clone(),
            shutdown.clone(),
        );
        server.start().await?;

        shutdown.shutdown().await;
        Ok(())
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME_LOWER);

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        tracing_subscriber::fmt()
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    /// Periodic health probes keep `/ready` accurate on an idle process.
    fn start_readiness_probe(
        keydir: KeyDirectory,
        bus: EventBus,
        readiness: ReadinessTracker,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(READINESS_PROBE_INTERVAL);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match keydir.health_check().await {
                            Ok(()) => readiness.record_keydir_ok(),
                            Err(e) => tracing::warn!(error = %e, "Key directory probe failed"),
                        }
                        match bus.health_check().await {
                            Ok(()) => readiness.record_bus_ok(),
                            Err(e) => tracing::warn!(error = %e, "Event bus probe failed"),
                        }
                    }
                }
            }
        })
    }
}
