use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A label-equality filter applied to a query. Label predicates only support
/// equality and negation; range and pattern matching are out of scope.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelFilter {
    pub key: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.end <= self.start {
            return Err("range end must be after start".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregation {
    Raw,
    Rate,
    P50,
    P75,
    P90,
    P95,
    P99,
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Aggregation {
    pub fn percentile_quantile(&self) -> Option<f64> {
        match self {
            Aggregation::P50 => Some(0.50),
            Aggregation::P75 => Some(0.75),
            Aggregation::P90 => Some(0.90),
            Aggregation::P95 => Some(0.95),
            Aggregation::P99 => Some(0.99),
            _ => None,
        }
    }

    pub fn is_percentile(&self) -> bool {
        self.percentile_quantile().is_some()
    }

    pub fn is_bucketable(&self) -> bool {
        matches!(
            self,
            Aggregation::Sum | Aggregation::Avg | Aggregation::Min | Aggregation::Max | Aggregation::Count
        )
    }
}

/// Request payload accepted by the QueryPlanner.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub metric_name: String,
    pub range: TimeRange,
    #[serde(default)]
    pub labels: Vec<LabelFilter>,
    pub aggregation: Aggregation,
    /// Bucketing interval in seconds; required when `aggregation` is one of
    /// SUM/AVG/MIN/MAX/COUNT and the caller wants a time series rather than
    /// a single whole-range bucket.
    #[serde(default)]
    pub interval_seconds: Option<u64>,
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketRow {
    pub bucket_start: DateTime<Utc>,
    pub avg: f64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub metric_name: String,
    pub aggregation: Aggregation,
    pub points: Vec<DataPoint>,
    /// True when the response was truncated at the query bucket cap.
    pub truncated: bool,
    /// True when any part of the range was served from the cold tier.
    pub served_from_archive: bool,
}

impl Serialize for Aggregation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            Aggregation::Raw => "RAW",
            Aggregation::Rate => "RATE",
            Aggregation::P50 => "P50",
            Aggregation::P75 => "P75",
            Aggregation::P90 => "P90",
            Aggregation::P95 => "P95",
            Aggregation::P99 => "P99",
            Aggregation::Sum => "SUM",
            Aggregation::Avg => "AVG",
            Aggregation::Min => "MIN",
            Aggregation::Max => "MAX",
            Aggregation::Count => "COUNT",
        };
        serializer.serialize_str(s)
    }
}

pub type LabelSet = BTreeMap<String, String>;
