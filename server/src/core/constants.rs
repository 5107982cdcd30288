// =============================================================================
// Application Identity
// =============================================================================

/// Application name in title case (for display)
pub const APP_NAME: &str = "Spanline";

/// Application name in lowercase (for paths and identifiers)
pub const APP_NAME_LOWER: &str = "spanline";

// =============================================================================
// Environment Variables
// =============================================================================

/// Environment variable for log level/filter
pub const ENV_LOG: &str = "SPANLINE_LOG";

/// Environment variable for ingress listen port
pub const ENV_INGRESS_PORT: &str = "INGRESS_PORT";

/// Environment variable for the maximum (post-inflation) request body size
pub const ENV_INGRESS_MAX_BODY_BYTES: &str = "INGRESS_MAX_BODY_BYTES";

/// Environment variable for the total per-request deadline
pub const ENV_INGRESS_REQUEST_TIMEOUT_MS: &str = "INGRESS_REQUEST_TIMEOUT_MS";

/// Environment variable for the event bus connection URL (Redis)
pub const ENV_EVENTBUS_URL: &str = "EVENTBUS_URL";

/// Environment variable for the approximate per-stream length bound
pub const ENV_EVENTBUS_STREAM_MAXLEN: &str = "EVENTBUS_STREAM_MAXLEN";

/// Environment variable for the metadata store (Postgres) URL
pub const ENV_METADATA_STORE_URL: &str = "METADATA_STORE_URL";

/// Environment variable for the columnar store (ClickHouse) URL
pub const ENV_COLUMNAR_STORE_URL: &str = "COLUMNAR_STORE_URL";

/// Environment variable for the columnar insert retry budget
pub const ENV_COLUMNAR_INSERT_RETRY_BUDGET: &str = "COLUMNAR_INSERT_RETRY_BUDGET";

/// Environment variable for the worker flush batch size
pub const ENV_WORKER_BATCH_SIZE: &str = "WORKER_BATCH_SIZE";

/// Environment variable for the worker flush interval
pub const ENV_WORKER_FLUSH_INTERVAL_MS: &str = "WORKER_FLUSH_INTERVAL_MS";

/// Environment variable for the per-subscriber broadcast queue size
pub const ENV_BROADCAST_SUBSCRIBER_QUEUE_SIZE: &str = "BROADCAST_SUBSCRIBER_QUEUE_SIZE";

/// Environment variable for CORS allowed origins (comma separated)
pub const ENV_ALLOWED_ORIGINS: &str = "ALLOWED_ORIGINS";

/// Environment variable for the persistence writer spill file path
pub const ENV_PERSIST_SPILL_PATH: &str = "PERSIST_SPILL_PATH";

// =============================================================================
// Server Defaults
// =============================================================================

/// Default ingress listen host
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default ingress listen port
pub const DEFAULT_INGRESS_PORT: u16 = 8080;

/// Default maximum request body size after decompression (5 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Default total per-request deadline
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Retry-After value returned with 503 responses (seconds)
pub const BACKPRESSURE_RETRY_AFTER_SECS: u64 = 5;

// =============================================================================
// Event Bus
// =============================================================================

/// Stream carrying raw ingested spans
pub const STREAM_SPANS_INGEST: &str = "spans.ingest";

/// Stream carrying derived security alerts
pub const STREAM_ALERTS_LIVE: &str = "alerts.live";

/// Suffix appended to a stream name to form its dead-letter stream
pub const DLQ_SUFFIX: &str = ".dlq";

/// Default approximate maximum stream length before eviction
pub const DEFAULT_STREAM_MAXLEN: u64 = 1_000_000;

/// Consumer group of the persistence writer
pub const GROUP_PERSISTENCE: &str = "persistence_writer";

/// Consumer group of the security analyzer
pub const GROUP_SECURITY: &str = "security_analyzer";

/// Consumer group of the cost aggregator
pub const GROUP_COST: &str = "cost_aggregator";

/// Consumer group of the broadcast hub
pub const GROUP_BROADCAST: &str = "broadcast_hub";

/// Delivery attempts before a message is dead-lettered
pub const POISON_MAX_ATTEMPTS: u32 = 3;

// =============================================================================
// Workers
// =============================================================================

/// Default blocking read window for consumer loops
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default flush batch size for batching workers
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 1_000;

/// Default flush interval for batching workers
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1_000;

/// Default columnar insert retry budget before spilling
pub const DEFAULT_INSERT_RETRY_BUDGET: u32 = 10;

/// Hard cap on buffered spans before reads stop
pub const PERSIST_BUFFER_HARD_CAP: usize = 50_000;

/// Size of the recent-id ring used to suppress crash-replay duplicates
pub const PERSIST_DEDUP_RING_SIZE: usize = 100_000;

/// Base delay for flush retry backoff
pub const FLUSH_BACKOFF_BASE_MS: u64 = 1_000;

/// Ceiling for flush retry backoff
pub const FLUSH_BACKOFF_MAX_MS: u64 = 30_000;

/// Attempts before a low-severity alert publish is dropped with a WARN
pub const ALERT_PUBLISH_MAX_ATTEMPTS: u32 = 5;

/// Interval between stuck-message claim sweeps (seconds)
pub const CLAIM_INTERVAL_SECS: u64 = 30;

/// Minimum idle time before a pending message may be claimed (milliseconds)
pub const CLAIM_MIN_IDLE_MS: u64 = 60_000;

/// Maximum messages claimed per sweep
pub const CLAIM_MAX_COUNT: usize = 100;

// =============================================================================
// Broadcast Hub
// =============================================================================

/// Default per-subscriber outgoing queue capacity
pub const DEFAULT_SUBSCRIBER_QUEUE_SIZE: usize = 256;

/// Per-send write timeout for subscriber connections
pub const SUBSCRIBER_WRITE_TIMEOUT_SECS: u64 = 5;

/// Consecutive write timeouts before a subscriber is disconnected
pub const SUBSCRIBER_MAX_WRITE_TIMEOUTS: u32 = 3;

/// Inbound idle window before a subscriber connection is closed
pub const SUBSCRIBER_IDLE_TIMEOUT_SECS: u64 = 60;

/// Maximum inbound control message size
pub const SUBSCRIBER_MAX_CONTROL_BYTES: usize = 4 * 1024;

// =============================================================================
// Key Directory
// =============================================================================

/// Required API key prefix
pub const API_KEY_PREFIX: &str = "ak_";

/// Minimum total API key length (prefix + 24 characters)
pub const API_KEY_MIN_LENGTH: usize = 27;

/// Maximum total API key length
pub const API_KEY_MAX_LENGTH: usize = 128;

/// TTL for cached negative key lookups (tolerates key rotation)
pub const KEYDIR_NEGATIVE_TTL_SECS: u64 = 60;

/// Capacity of the positive key cache
pub const KEYDIR_CACHE_CAPACITY: u64 = 100_000;

// =============================================================================
// Readiness
// =============================================================================

/// A dependency is considered ready if it succeeded within this window
pub const READINESS_WINDOW_SECS: u64 = 30;

// =============================================================================
// Shutdown
// =============================================================================

/// Maximum time to wait for background tasks during shutdown
pub const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Span Validation Limits
// =============================================================================

/// Maximum length of span_id and trace_id
pub const SPAN_ID_MAX_LENGTH: usize = 128;

/// Maximum number of attribute entries per span
pub const SPAN_MAX_ATTRIBUTES: usize = 256;

/// Maximum byte length of a single attribute value
pub const SPAN_ATTRIBUTE_VALUE_MAX_BYTES: usize = 8 * 1024;

/// Maximum number of events per span
pub const SPAN_MAX_EVENTS: usize = 128;

/// Maximum length of an alert evidence excerpt
pub const ALERT_EVIDENCE_MAX_CHARS: usize = 512;
