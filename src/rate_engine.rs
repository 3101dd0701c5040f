use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::models::metric::MetricKind;
use crate::models::query::{DataPoint, TimeRange};
use crate::registry::MetricRegistry;
use crate::storage::StorageGateway;

/// Per-series counter rate with reset detection. Grounded in the same
/// pairwise-delta approach as a PromQL `rate()` evaluator, but emits one
/// point per consecutive sample pair rather than a single whole-range value,
/// since the planner needs a rate *time series*, not one scalar.
pub struct RateEngine {
    storage: Arc<dyn StorageGateway>,
    registry: Arc<MetricRegistry>,
}

impl RateEngine {
    pub fn new(storage: Arc<dyn StorageGateway>, registry: Arc<MetricRegistry>) -> Self {
        Self { storage, registry }
    }

    pub async fn rate(
        &self,
        metric_id: Uuid,
        range: TimeRange,
        labels: &std::collections::BTreeMap<String, String>,
        limit: u64,
    ) -> EngineResult<Vec<DataPoint>> {
        let metric = self.registry.get_by_id(metric_id).await?;
        if let Some(metric) = &metric {
            if metric.kind != MetricKind::Counter {
                return Err(crate::error::EngineError::BadInput(format!(
                    "RATE requires a COUNTER metric, '{}' is {:?}",
                    metric.name, metric.kind
                )));
            }
        }

        let raw = self.storage.read_raw(metric_id, range, labels, limit).await?;

        let mut by_series: BTreeMap<Vec<(String, String)>, Vec<(chrono::DateTime<chrono::Utc>, f64)>> = BTreeMap::new();
        for (t, v, series_labels) in raw {
            let key: Vec<(String, String)> = series_labels.into_iter().collect();
            by_series.entry(key).or_default().push((t, v));
        }

        let mut points = Vec::new();
        for (key, series) in &by_series {
            let series_labels: BTreeMap<String, String> = key.iter().cloned().collect();
            points.extend(pairwise_rate(series, &series_labels));
        }
        points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(points)
    }
}

/// Walks consecutive timestamped values and emits a reset-aware rate at each
/// step after the first, matching the `(non-negative delta) / dt` rule with
/// a counter-reset fallback of treating the new value as the full increase.
/// `labels` is the SeriesKey all of `samples` belongs to and is attached to
/// every emitted point.
fn pairwise_rate(samples: &[(chrono::DateTime<chrono::Utc>, f64)], labels: &BTreeMap<String, String>) -> Vec<DataPoint> {
    let mut points = Vec::with_capacity(samples.len().saturating_sub(1));
    for window in samples.windows(2) {
        let (prev_t, prev_v) = window[0];
        let (t, v) = window[1];
        let dt = (t - prev_t).num_milliseconds() as f64 / 1000.0;
        if dt <= 0.0 {
            continue;
        }
        let delta = if v >= prev_v { v - prev_v } else { v };
        points.push(DataPoint {
            timestamp: t,
            value: delta / dt,
            labels: labels.clone(),
        });
    }
    points
}
