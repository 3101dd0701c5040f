use serde::Deserialize;
use std::path::Path;

/// Top-level config loaded from `metric_engine.toml`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricEngineConfig {
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub cardinality: CardinalityConfig,
    #[serde(default)]
    pub hot_tier: HotTierConfig,
    #[serde(default)]
    pub cold_tier: ColdTierConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestionConfig {
    #[serde(default = "default_buffer_max_size")]
    pub buffer_max_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_ingest_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            buffer_max_size: default_buffer_max_size(),
            flush_interval_ms: default_flush_interval_ms(),
            batch_size: default_ingest_batch_size(),
            worker_threads: default_worker_threads(),
        }
    }
}

fn default_buffer_max_size() -> usize {
    10_000
}
fn default_flush_interval_ms() -> u64 {
    5_000
}
fn default_ingest_batch_size() -> usize {
    1_000
}
fn default_worker_threads() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardinalityConfig {
    #[serde(default = "default_max_series_per_metric")]
    pub max_series_per_metric: u64,
    #[serde(default = "default_max_labels_per_metric")]
    pub max_labels_per_metric: usize,
    #[serde(default = "default_max_label_value_length")]
    pub max_label_value_length: usize,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "default_check_window_hours")]
    pub check_window_hours: i64,
    #[serde(default = "default_probe_rate_per_min")]
    pub probe_rate_per_min: u32,
    #[serde(default = "default_probe_cache_ttl_secs")]
    pub probe_cache_ttl_secs: u64,
}

impl Default for CardinalityConfig {
    fn default() -> Self {
        Self {
            max_series_per_metric: default_max_series_per_metric(),
            max_labels_per_metric: default_max_labels_per_metric(),
            max_label_value_length: default_max_label_value_length(),
            warning_threshold: default_warning_threshold(),
            check_window_hours: default_check_window_hours(),
            probe_rate_per_min: default_probe_rate_per_min(),
            probe_cache_ttl_secs: default_probe_cache_ttl_secs(),
        }
    }
}

fn default_max_series_per_metric() -> u64 {
    10_000
}
fn default_max_labels_per_metric() -> usize {
    10
}
fn default_max_label_value_length() -> usize {
    100
}
fn default_warning_threshold() -> f64 {
    0.8
}
fn default_check_window_hours() -> i64 {
    24
}
fn default_probe_rate_per_min() -> u32 {
    10
}
fn default_probe_cache_ttl_secs() -> u64 {
    3_600
}

#[derive(Debug, Clone, Deserialize)]
pub struct HotTierConfig {
    #[serde(default = "default_hot_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_compression_after_days")]
    pub compression_after_days: u32,
}

impl Default for HotTierConfig {
    fn default() -> Self {
        Self {
            retention_days: default_hot_retention_days(),
            compression_after_days: default_compression_after_days(),
        }
    }
}

fn default_hot_retention_days() -> u32 {
    10
}
fn default_compression_after_days() -> u32 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColdTierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cold_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_archival_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_delay_between_batches_ms")]
    pub delay_between_batches_ms: u64,
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    #[serde(default = "default_vacuum_threshold_rows")]
    pub vacuum_threshold_rows: u64,
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

impl Default for ColdTierConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            retention_days: default_cold_retention_days(),
            batch_size: default_archival_batch_size(),
            delay_between_batches_ms: default_delay_between_batches_ms(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
            vacuum_threshold_rows: default_vacuum_threshold_rows(),
            cron: default_cron(),
            bucket: default_bucket(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_cold_retention_days() -> u32 {
    30
}
fn default_archival_batch_size() -> usize {
    5_000
}
fn default_delay_between_batches_ms() -> u64 {
    1_000
}
fn default_max_concurrent_uploads() -> usize {
    3
}
fn default_vacuum_threshold_rows() -> u64 {
    100_000
}
fn default_cron() -> String {
    "0 0 2 * * ?".to_string()
}
fn default_bucket() -> String {
    "metric-archive".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_query_limit")]
    pub default_limit: u64,
    #[serde(default = "default_max_limit")]
    pub max_limit: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_bucket_cap")]
    pub bucket_cap: usize,
    #[serde(default = "default_bucket_hard_timeout_secs")]
    pub bucket_hard_timeout_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_query_limit(),
            max_limit: default_max_limit(),
            timeout_seconds: default_timeout_seconds(),
            bucket_cap: default_bucket_cap(),
            bucket_hard_timeout_secs: default_bucket_hard_timeout_secs(),
        }
    }
}

fn default_query_limit() -> u64 {
    100
}
fn default_max_limit() -> u64 {
    10_000
}
fn default_timeout_seconds() -> u64 {
    30
}
fn default_bucket_cap() -> usize {
    1_000
}
fn default_bucket_hard_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ObjectStoreConfig {
    pub endpoint: Option<String>,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

impl MetricEngineConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: MetricEngineConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = MetricEngineConfig::default();
        assert_eq!(cfg.ingestion.buffer_max_size, 10_000);
        assert_eq!(cfg.cardinality.max_series_per_metric, 10_000);
        assert_eq!(cfg.cold_tier.retention_days, 30);
        assert_eq!(cfg.query.bucket_cap, 1_000);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let cfg = MetricEngineConfig::load("/nonexistent/path/metric_engine.toml").unwrap();
        assert_eq!(cfg.hot_tier.retention_days, 10);
    }
}
