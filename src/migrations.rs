use clickhouse::Client;

use crate::config::MetricEngineConfig;

/// Ordered list of DDL statements that create the metric store's schema.
/// Every statement is idempotent (`IF NOT EXISTS`) so it is safe to run on
/// every startup.
const MIGRATIONS: &[&str] = &[
    "CREATE DATABASE IF NOT EXISTS metrics",

    // ── Metric registry ──
    r"CREATE TABLE IF NOT EXISTS metrics.metrics
(
    id              UUID,
    name            String,
    kind            LowCardinality(String),
    description     String DEFAULT '',
    unit            String DEFAULT '',
    retention_days  UInt32 DEFAULT 30,
    is_active       Bool DEFAULT true,
    created_at      DateTime64(3, 'UTC'),
    updated_at      DateTime64(3, 'UTC'),
    INDEX idx_name name TYPE bloom_filter(0.01) GRANULARITY 1
)
ENGINE = ReplacingMergeTree(updated_at)
ORDER BY id
SETTINGS index_granularity = 8192",

    r"CREATE TABLE IF NOT EXISTS metrics.metric_labels
(
    metric_id  UUID,
    label_key  String
)
ENGINE = ReplacingMergeTree
ORDER BY (metric_id, label_key)
SETTINGS index_granularity = 8192",

    // ── Raw samples, chunked daily like a hypertable. ReplacingMergeTree keyed
    // on ingested_at so a repeated upsert of the same (time, metric_id, labels)
    // leaves exactly one row after the background merge picks the newest write. ──
    r"CREATE TABLE IF NOT EXISTS metrics.metric_samples
(
    time        DateTime64(3, 'UTC') CODEC(Delta, ZSTD(1)),
    metric_id   UUID,
    value       Float64 CODEC(Gorilla, ZSTD(1)),
    labels      String CODEC(ZSTD(1)),
    ingested_at DateTime64(3, 'UTC') DEFAULT now64(3),
    INDEX idx_labels labels TYPE tokenbf_v1(32768, 3, 0) GRANULARITY 4
)
ENGINE = ReplacingMergeTree(ingested_at)
PARTITION BY toDate(time)
ORDER BY (metric_id, labels, time)
SETTINGS index_granularity = 8192, ttl_only_drop_parts = 1",

    // ── Continuous aggregates at 5m / 1h / 1d granularity ──
    r"CREATE TABLE IF NOT EXISTS metrics.metric_samples_5m
(
    bucket    DateTime64(3, 'UTC'),
    metric_id UUID,
    labels    String,
    avg       AggregateFunction(avg, Float64),
    sum       AggregateFunction(sum, Float64),
    min       AggregateFunction(min, Float64),
    max       AggregateFunction(max, Float64),
    count     AggregateFunction(count, Float64)
)
ENGINE = AggregatingMergeTree
PARTITION BY toDate(bucket)
ORDER BY (metric_id, labels, bucket)",

    r"CREATE MATERIALIZED VIEW IF NOT EXISTS metrics.metric_samples_5m_mv
TO metrics.metric_samples_5m
AS SELECT
    toStartOfFiveMinutes(time) AS bucket,
    metric_id,
    labels,
    avgState(value) AS avg,
    sumState(value) AS sum,
    minState(value) AS min,
    maxState(value) AS max,
    countState(value) AS count
FROM metrics.metric_samples
GROUP BY bucket, metric_id, labels",

    r"CREATE TABLE IF NOT EXISTS metrics.metric_samples_1h
(
    bucket    DateTime64(3, 'UTC'),
    metric_id UUID,
    labels    String,
    avg       AggregateFunction(avg, Float64),
    sum       AggregateFunction(sum, Float64),
    min       AggregateFunction(min, Float64),
    max       AggregateFunction(max, Float64),
    count     AggregateFunction(count, Float64)
)
ENGINE = AggregatingMergeTree
PARTITION BY toDate(bucket)
ORDER BY (metric_id, labels, bucket)",

    r"CREATE MATERIALIZED VIEW IF NOT EXISTS metrics.metric_samples_1h_mv
TO metrics.metric_samples_1h
AS SELECT
    toStartOfHour(time) AS bucket,
    metric_id,
    labels,
    avgState(value) AS avg,
    sumState(value) AS sum,
    minState(value) AS min,
    maxState(value) AS max,
    countState(value) AS count
FROM metrics.metric_samples
GROUP BY bucket, metric_id, labels",

    r"CREATE TABLE IF NOT EXISTS metrics.metric_samples_1d
(
    bucket    DateTime64(3, 'UTC'),
    metric_id UUID,
    labels    String,
    avg       AggregateFunction(avg, Float64),
    sum       AggregateFunction(sum, Float64),
    min       AggregateFunction(min, Float64),
    max       AggregateFunction(max, Float64),
    count     AggregateFunction(count, Float64)
)
ENGINE = AggregatingMergeTree
PARTITION BY toYYYYMM(bucket)
ORDER BY (metric_id, labels, bucket)",

    r"CREATE MATERIALIZED VIEW IF NOT EXISTS metrics.metric_samples_1d_mv
TO metrics.metric_samples_1d
AS SELECT
    toStartOfDay(time) AS bucket,
    metric_id,
    labels,
    avgState(value) AS avg,
    sumState(value) AS sum,
    minState(value) AS min,
    maxState(value) AS max,
    countState(value) AS count
FROM metrics.metric_samples
GROUP BY bucket, metric_id, labels",

    // ── Cold-storage archive index ──
    r"CREATE TABLE IF NOT EXISTS metrics.cold_storage_metadata
(
    id                 UUID,
    metric_id          UUID,
    metric_name        String,
    start_time         DateTime64(3, 'UTC'),
    end_time           DateTime64(3, 'UTC'),
    object_path        String,
    file_format        LowCardinality(String),
    file_size_bytes    UInt64,
    row_count          UInt64,
    compression_ratio  Float64,
    labels_index       String,
    created_at         DateTime64(3, 'UTC')
)
ENGINE = ReplacingMergeTree
ORDER BY (metric_id, start_time, end_time)
SETTINGS index_granularity = 8192",
];

/// Run all migrations against ClickHouse, then apply config-driven retention.
///
/// Connects without a default database so that `CREATE DATABASE` succeeds
/// even on a fresh instance. Every statement uses `IF NOT EXISTS`, so this is
/// safe to call on every startup.
pub async fn run(url: &str, user: &str, password: &str, config: &MetricEngineConfig) -> anyhow::Result<()> {
    let client = Client::default()
        .with_url(url)
        .with_user(user)
        .with_password(password);

    tracing::info!("running clickhouse migrations ({} statements)", MIGRATIONS.len());

    for (i, sql) in MIGRATIONS.iter().enumerate() {
        let preview: String = sql.chars().take(80).collect();
        tracing::debug!("migration {}/{}: {}...", i + 1, MIGRATIONS.len(), preview);
        client.query(sql).execute().await.map_err(|e| {
            tracing::error!("migration {}/{} failed: {e}", i + 1, MIGRATIONS.len());
            e
        })?;
    }

    tracing::info!("clickhouse migrations complete");

    apply_hot_tier_ttl(&client, config).await?;

    Ok(())
}

/// The hot tier keeps `hot_tier.retention_days` worth of raw samples; beyond
/// that the ArchivalEngine is responsible for moving data to the cold tier
/// before it would otherwise be dropped, so the table-level TTL is set with
/// a margin past the configured archival cutoff rather than matching it
/// exactly.
async fn apply_hot_tier_ttl(client: &Client, config: &MetricEngineConfig) -> anyhow::Result<()> {
    let days = config.hot_tier.retention_days + config.cold_tier.retention_days;
    let sql = format!(
        "ALTER TABLE metrics.metric_samples MODIFY TTL toDateTime(time) + INTERVAL {days} DAY DELETE"
    );
    if let Err(e) = client.query(&sql).execute().await {
        tracing::warn!("failed to set TTL on metric_samples: {e}");
    }
    Ok(())
}
