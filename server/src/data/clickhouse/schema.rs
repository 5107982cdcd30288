//! ClickHouse schema definitions
//!
//! Three tables back the pipeline:
//! - `agent_spans`: one row per ingested span. ReplacingMergeTree keyed by
//!   `(project_id, span_id)` lets duplicate rows from crash replay collapse
//!   at merge/query time.
//! - `security_alerts`: one row per emitted alert.
//! - `cost_metrics`: SummingMergeTree aggregating token and cost columns on
//!   identical `(project_id, model, timestamp)`.

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i32 = 1;

/// DDL applied on startup (idempotent)
pub fn schema_statements() -> Vec<&'static str> {
    vec![
        r"CREATE TABLE IF NOT EXISTS schema_version (
            id UInt8,
            version Int32,
            applied_at Int64,
            description String
        ) ENGINE = ReplacingMergeTree(applied_at)
        ORDER BY id",
        r"CREATE TABLE IF NOT EXISTS agent_spans (
            span_id String,
            trace_id String,
            parent_span_id Nullable(String),
            project_id String,
            name String,
            service_name String,
            status LowCardinality(String),
            start_time DateTime64(6, 'UTC'),
            end_time DateTime64(6, 'UTC'),
            duration_ms Float64,
            attributes Map(String, String),
            events String,
            ingested_at DateTime64(6, 'UTC')
        ) ENGINE = ReplacingMergeTree(ingested_at)
        PARTITION BY toYYYYMM(start_time)
        ORDER BY (project_id, span_id)",
        r"CREATE TABLE IF NOT EXISTS security_alerts (
            id String,
            project_id String,
            trace_id String,
            span_id String,
            rule_name LowCardinality(String),
            severity LowCardinality(String),
            score Float64,
            description String,
            evidence String,
            created_at DateTime64(6, 'UTC')
        ) ENGINE = MergeTree
        PARTITION BY toYYYYMM(created_at)
        ORDER BY (project_id, created_at)",
        r"CREATE TABLE IF NOT EXISTS cost_metrics (
            project_id String,
            model LowCardinality(String),
            span_kind LowCardinality(String),
            timestamp DateTime('UTC'),
            prompt_tokens UInt64,
            completion_tokens UInt64,
            total_tokens UInt64,
            cost_usd Float64
        ) ENGINE = SummingMergeTree((prompt_tokens, completion_tokens, total_tokens, cost_usd))
        PARTITION BY toYYYYMM(timestamp)
        ORDER BY (project_id, model, timestamp)",
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_covers_all_tables() {
        let ddl = schema_statements().join("\n");
        for table in ["agent_spans", "security_alerts", "cost_metrics"] {
            assert!(ddl.contains(table), "missing table {table}");
        }
    }
}
