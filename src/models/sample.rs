use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A single ingested data point, keyed by (metric, label set, time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub metric_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// A `Sample` that has passed validation and been resolved against the
/// registry, ready for the write buffer / storage gateway.
#[derive(Debug, Clone)]
pub struct ResolvedSample {
    pub metric_id: Uuid,
    pub metric_name: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub labels: BTreeMap<String, String>,
}

/// Identifies one unique time series within a metric: the metric plus its
/// exact label assignment. Two samples with the same `SeriesKey` belong to
/// the same series and are subject to the cardinality cap together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    pub metric_id: Uuid,
    pub labels: Vec<(String, String)>,
}

impl SeriesKey {
    pub fn new(metric_id: Uuid, labels: &BTreeMap<String, String>) -> Self {
        Self {
            metric_id,
            labels: labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        }
    }
}

pub const SAMPLE_VALUE_MAX_ABS: f64 = 1e300;

/// A value is acceptable if it is finite (no NaN, no +/-Infinity) and within
/// a sane magnitude bound.
pub fn validate_sample_value(value: f64) -> Result<(), String> {
    if !value.is_finite() {
        return Err(format!("sample value {value} is not finite"));
    }
    if value.abs() > SAMPLE_VALUE_MAX_ABS {
        return Err(format!("sample value {value} exceeds magnitude bound"));
    }
    Ok(())
}

/// Samples older than this are rejected, counted from `now` at validation time.
pub const MAX_PAST_DAYS: i64 = 365;

/// A timestamp is acceptable if it is not more than `max_future_secs` ahead of
/// `now`, not before the Unix epoch, and not more than `MAX_PAST_DAYS` behind `now`.
pub fn validate_sample_timestamp(
    timestamp: DateTime<Utc>,
    now: DateTime<Utc>,
    max_future_secs: i64,
) -> Result<(), String> {
    if timestamp.timestamp() < 0 {
        return Err("timestamp predates the Unix epoch".to_string());
    }
    let min_past = now - chrono::Duration::days(MAX_PAST_DAYS);
    if timestamp < min_past {
        return Err(format!(
            "timestamp {timestamp} is more than {MAX_PAST_DAYS}d in the past"
        ));
    }
    let max_future = now + chrono::Duration::seconds(max_future_secs);
    if timestamp > max_future {
        return Err(format!(
            "timestamp {timestamp} is more than {max_future_secs}s in the future"
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestBatch {
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct IngestResult {
    pub accepted: usize,
    pub rejected: usize,
    pub errors: Vec<IngestError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestError {
    pub index: usize,
    pub reason: String,
}
