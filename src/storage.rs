use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::models::query::{BucketRow, TimeRange};
use crate::models::sample::ResolvedSample;

/// Granularity of a pre-aggregated continuous-aggregate view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateView {
    FiveMinutes,
    OneHour,
    OneDay,
}

impl AggregateView {
    fn table(&self) -> &'static str {
        match self {
            AggregateView::FiveMinutes => "metrics.metric_samples_5m",
            AggregateView::OneHour => "metrics.metric_samples_1h",
            AggregateView::OneDay => "metrics.metric_samples_1d",
        }
    }

    /// Pick the coarsest view whose bucket size divides evenly into the
    /// requested interval, so a single merge step reconstructs it.
    pub fn for_interval_seconds(interval_seconds: u64) -> Self {
        if interval_seconds % 86_400 == 0 {
            AggregateView::OneDay
        } else if interval_seconds % 3_600 == 0 {
            AggregateView::OneHour
        } else {
            AggregateView::FiveMinutes
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
struct SampleRow {
    #[serde(with = "clickhouse::serde::time::datetime")]
    time: DateTime<Utc>,
    value: f64,
    labels: String,
}

#[derive(Debug, Clone, Deserialize, clickhouse::Row)]
struct BucketQueryRow {
    #[serde(with = "clickhouse::serde::time::datetime")]
    bucket: DateTime<Utc>,
    avg: f64,
    sum: f64,
    min: f64,
    max: f64,
    count: u64,
}

#[derive(Debug, Clone, Deserialize, clickhouse::Row)]
struct PercentileRow {
    p: f64,
}

#[derive(Debug, Clone, Deserialize, clickhouse::Row)]
struct CountRow {
    n: u64,
}

#[derive(Debug, Clone, Deserialize, clickhouse::Row)]
struct MetricIdRow {
    #[serde(with = "clickhouse::serde::uuid")]
    metric_id: Uuid,
}

/// The time-series store contract the engine depends on: row-level writes,
/// raw reads, bucketed aggregates, percentile estimation, cardinality
/// counting, and batched deletion for the archival sweep.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    async fn upsert(&self, sample: &ResolvedSample) -> EngineResult<()>;
    async fn upsert_batch(&self, samples: &[ResolvedSample]) -> EngineResult<()>;
    async fn read_raw(
        &self,
        metric_id: Uuid,
        range: TimeRange,
        labels: &BTreeMap<String, String>,
        limit: u64,
    ) -> EngineResult<Vec<(DateTime<Utc>, f64, BTreeMap<String, String>)>>;
    async fn bucket(
        &self,
        interval_seconds: u64,
        metric_id: Uuid,
        range: TimeRange,
        labels: &BTreeMap<String, String>,
        cap: usize,
    ) -> EngineResult<Vec<BucketRow>>;
    async fn percentile(
        &self,
        quantile: f64,
        metric_id: Uuid,
        range: TimeRange,
        labels: &BTreeMap<String, String>,
    ) -> EngineResult<Option<f64>>;
    async fn count_distinct_label_combinations(
        &self,
        metric_id: Uuid,
        since: DateTime<Utc>,
    ) -> EngineResult<u64>;
    async fn delete_by_range_batched(
        &self,
        metric_id: Uuid,
        range: TimeRange,
        batch_size: u64,
    ) -> EngineResult<u64>;
    async fn find_distinct_metrics_before(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Uuid>>;
    /// Fire a non-blocking request for the engine to reclaim space freed by a
    /// batch of deletes. Best-effort: a failure here must never fail the
    /// caller's larger operation.
    async fn request_vacuum(&self) -> EngineResult<()>;
}

pub struct ClickHouseStorage {
    client: Client,
}

impl ClickHouseStorage {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn where_clause(labels: &BTreeMap<String, String>) -> String {
        if labels.is_empty() {
            return String::new();
        }
        let encoded = encode_labels(labels);
        format!(" AND labels = '{}'", escape(&encoded))
    }
}

/// Labels are stored as a canonical JSON object string (sorted keys) so
/// equality comparison on the `labels` column is a cheap string match
/// instead of a per-key JSONExtract for every predicate.
pub fn encode_labels(labels: &BTreeMap<String, String>) -> String {
    serde_json::to_string(labels).unwrap_or_else(|_| "{}".to_string())
}

pub fn decode_labels(raw: &str) -> BTreeMap<String, String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl StorageGateway for ClickHouseStorage {
    async fn upsert(&self, sample: &ResolvedSample) -> EngineResult<()> {
        self.upsert_batch(std::slice::from_ref(sample)).await
    }

    async fn upsert_batch(&self, samples: &[ResolvedSample]) -> EngineResult<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut insert = self
            .client
            .insert("metrics.metric_samples")
            .map_err(EngineError::from)?;
        for sample in samples {
            insert
                .write(&RowWithMetric {
                    time: sample.timestamp,
                    metric_id: sample.metric_id,
                    value: sample.value,
                    labels: encode_labels(&sample.labels),
                })
                .await
                .map_err(EngineError::from)?;
        }
        insert.end().await.map_err(EngineError::from)?;
        Ok(())
    }

    async fn read_raw(
        &self,
        metric_id: Uuid,
        range: TimeRange,
        labels: &BTreeMap<String, String>,
        limit: u64,
    ) -> EngineResult<Vec<(DateTime<Utc>, f64, BTreeMap<String, String>)>> {
        let sql = format!(
            "SELECT time, value, labels FROM metrics.metric_samples FINAL \
             WHERE metric_id = ? AND time >= ? AND time <= ?{} \
             ORDER BY time ASC LIMIT {}",
            Self::where_clause(labels),
            limit
        );
        let rows: Vec<SampleRow> = self
            .client
            .query(&sql)
            .bind(metric_id)
            .bind(range.start)
            .bind(range.end)
            .fetch_all()
            .await
            .map_err(EngineError::from)?;
        Ok(rows.into_iter().map(|r| (r.time, r.value, decode_labels(&r.labels))).collect())
    }

    async fn bucket(
        &self,
        interval_seconds: u64,
        metric_id: Uuid,
        range: TimeRange,
        labels: &BTreeMap<String, String>,
        cap: usize,
    ) -> EngineResult<Vec<BucketRow>> {
        let view = AggregateView::for_interval_seconds(interval_seconds);
        let sql = format!(
            "SELECT bucket, \
                    avgMerge(avg) AS avg, sumMerge(sum) AS sum, \
                    minMerge(min) AS min, maxMerge(max) AS max, \
                    countMerge(count) AS count \
             FROM {} \
             WHERE metric_id = ? AND bucket >= ? AND bucket <= ?{} \
             GROUP BY bucket ORDER BY bucket ASC LIMIT {}",
            view.table(),
            Self::where_clause(labels),
            cap
        );
        let rows: Vec<BucketQueryRow> = self
            .client
            .query(&sql)
            .bind(metric_id)
            .bind(range.start)
            .bind(range.end)
            .fetch_all()
            .await
            .map_err(EngineError::from)?;
        Ok(rows
            .into_iter()
            .map(|r| BucketRow {
                bucket_start: r.bucket,
                avg: r.avg,
                sum: r.sum,
                min: r.min,
                max: r.max,
                count: r.count,
            })
            .collect())
    }

    async fn percentile(
        &self,
        quantile: f64,
        metric_id: Uuid,
        range: TimeRange,
        labels: &BTreeMap<String, String>,
    ) -> EngineResult<Option<f64>> {
        let sql = format!(
            "SELECT quantile({quantile})(value) AS p FROM metrics.metric_samples FINAL \
             WHERE metric_id = ? AND time >= ? AND time <= ?{}",
            Self::where_clause(labels)
        );
        let rows: Vec<PercentileRow> = self
            .client
            .query(&sql)
            .bind(metric_id)
            .bind(range.start)
            .bind(range.end)
            .fetch_all()
            .await
            .map_err(EngineError::from)?;
        Ok(rows.first().map(|r| r.p))
    }

    async fn count_distinct_label_combinations(
        &self,
        metric_id: Uuid,
        since: DateTime<Utc>,
    ) -> EngineResult<u64> {
        let sql = "SELECT uniqExact(labels) AS n FROM metrics.metric_samples FINAL \
                   WHERE metric_id = ? AND time >= ?";
        let rows: Vec<CountRow> = self
            .client
            .query(sql)
            .bind(metric_id)
            .bind(since)
            .fetch_all()
            .await
            .map_err(EngineError::from)?;
        Ok(rows.first().map(|r| r.n).unwrap_or(0))
    }

    async fn delete_by_range_batched(
        &self,
        metric_id: Uuid,
        range: TimeRange,
        batch_size: u64,
    ) -> EngineResult<u64> {
        let count_sql = "SELECT count() AS n FROM metrics.metric_samples FINAL \
                         WHERE metric_id = ? AND time >= ? AND time < ?";
        let rows: Vec<CountRow> = self
            .client
            .query(count_sql)
            .bind(metric_id)
            .bind(range.start)
            .bind(range.end)
            .fetch_all()
            .await
            .map_err(EngineError::from)?;
        let total = rows.first().map(|r| r.n).unwrap_or(0);

        let delete_sql = "ALTER TABLE metrics.metric_samples DELETE \
                          WHERE metric_id = ? AND time >= ? AND time < ?";
        self.client
            .query(delete_sql)
            .bind(metric_id)
            .bind(range.start)
            .bind(range.end)
            .execute()
            .await
            .map_err(EngineError::from)?;

        let _ = batch_size; // ClickHouse mutations are already chunked server-side.
        Ok(total)
    }

    async fn find_distinct_metrics_before(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Uuid>> {
        let sql = "SELECT DISTINCT metric_id FROM metrics.metric_samples FINAL WHERE time < ?";
        let rows: Vec<MetricIdRow> = self
            .client
            .query(sql)
            .bind(cutoff)
            .fetch_all()
            .await
            .map_err(EngineError::from)?;
        Ok(rows.into_iter().map(|r| r.metric_id).collect())
    }

    async fn request_vacuum(&self) -> EngineResult<()> {
        // Fired without FINAL/wait; ClickHouse queues the optimize and returns
        // once it's scheduled rather than once every part is merged.
        self.client
            .query("OPTIMIZE TABLE metrics.metric_samples")
            .execute()
            .await
            .map_err(EngineError::from)
    }
}

#[derive(Debug, Clone, Serialize, clickhouse::Row)]
struct RowWithMetric {
    #[serde(with = "clickhouse::serde::time::datetime")]
    time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::uuid")]
    metric_id: Uuid,
    value: f64,
    labels: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_encoding_round_trips() {
        let mut labels = BTreeMap::new();
        labels.insert("host".to_string(), "a".to_string());
        labels.insert("env".to_string(), "prod".to_string());
        let encoded = encode_labels(&labels);
        assert_eq!(decode_labels(&encoded), labels);
    }

    #[test]
    fn aggregate_view_picks_coarsest_divisor() {
        assert_eq!(AggregateView::for_interval_seconds(86_400), AggregateView::OneDay);
        assert_eq!(AggregateView::for_interval_seconds(3_600), AggregateView::OneHour);
        assert_eq!(AggregateView::for_interval_seconds(60), AggregateView::FiveMinutes);
    }

    #[test]
    fn where_clause_empty_for_no_labels() {
        assert_eq!(ClickHouseStorage::where_clause(&BTreeMap::new()), "");
    }
}
