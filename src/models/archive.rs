use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Archive segments are newline-delimited JSON, gzip-compressed. This is the
/// one encoding the object-store contract names; `file_format` is still
/// stored per-segment so a future encoding can be introduced without a
/// migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    JsonGz,
}

impl ArchiveFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArchiveFormat::JsonGz => "json.gz",
        }
    }
}

/// Metadata row describing one archived (metric, day) segment moved to the
/// cold object store. The row is the only durable record of where a segment
/// lives; the object itself carries no index.
#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
pub struct ArchiveSegment {
    #[serde(with = "clickhouse::serde::uuid")]
    pub id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    pub metric_id: Uuid,
    pub metric_name: String,
    #[serde(with = "clickhouse::serde::time::datetime")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::time::datetime")]
    pub end_time: DateTime<Utc>,
    pub object_path: String,
    pub file_format: String,
    pub file_size_bytes: u64,
    pub row_count: u64,
    pub compression_ratio: f64,
    /// JSON-encoded array of the distinct label key/value pairs present in
    /// the segment, used only to answer "which segments might contain series
    /// X" without decompressing every object.
    pub labels_index: String,
    #[serde(with = "clickhouse::serde::time::datetime")]
    pub created_at: DateTime<Utc>,
}

impl ArchiveSegment {
    /// `metrics/<metricId>/<YYYY-MM-DD>.json.gz`, per the object store's naming convention.
    pub fn object_key(metric_id: Uuid, start_time: DateTime<Utc>, format: ArchiveFormat) -> String {
        format!(
            "metrics/{}/{}.{}",
            metric_id,
            start_time.format("%Y-%m-%d"),
            format.extension()
        )
    }
}
