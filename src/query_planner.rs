use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::{HotTierConfig, QueryConfig};
use crate::error::{EngineError, EngineResult};
use crate::models::query::{Aggregation, BucketRow, DataPoint, FilterOp, QueryRequest, QueryResponse, TimeRange};
use crate::rate_engine::RateEngine;
use crate::registry::MetricRegistry;
use crate::storage::StorageGateway;

/// Read-back contract the cold tier satisfies. Kept as a trait here so the
/// planner doesn't depend on the archival engine's scheduling internals,
/// only on its ability to answer a range query.
#[async_trait]
pub trait ArchiveReader: Send + Sync {
    async fn query_archive(
        &self,
        metric_id: Uuid,
        range: TimeRange,
    ) -> EngineResult<Vec<(DateTime<Utc>, f64, BTreeMap<String, String>)>>;
}

const MAX_QUERY_SPAN_DAYS: i64 = 90;

/// Routes a query to raw reads, a rate computation, a percentile probe, or a
/// bucketed aggregate, optionally fanning out to the archive for the portion
/// of the range older than the hot tier's retention window.
pub struct QueryPlanner {
    registry: Arc<MetricRegistry>,
    storage: Arc<dyn StorageGateway>,
    rate_engine: Arc<RateEngine>,
    archive: Arc<dyn ArchiveReader>,
    clock: Arc<dyn Clock>,
    hot_tier: HotTierConfig,
    query: QueryConfig,
}

impl QueryPlanner {
    pub fn new(
        registry: Arc<MetricRegistry>,
        storage: Arc<dyn StorageGateway>,
        rate_engine: Arc<RateEngine>,
        archive: Arc<dyn ArchiveReader>,
        clock: Arc<dyn Clock>,
        hot_tier: HotTierConfig,
        query: QueryConfig,
    ) -> Self {
        Self {
            registry,
            storage,
            rate_engine,
            archive,
            clock,
            hot_tier,
            query,
        }
    }

    pub async fn execute(&self, request: QueryRequest) -> EngineResult<QueryResponse> {
        if request.metric_name.trim().is_empty() {
            return Err(EngineError::BadInput("metric_name must not be empty".to_string()));
        }
        let range = self.resolve_range(request.range)?;
        let limit = request.limit.unwrap_or(self.query.default_limit).min(self.query.max_limit);

        let metric = self
            .registry
            .get_by_name(&request.metric_name)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("metric '{}' not found", request.metric_name)))?;

        let labels = self.equality_labels(&request.labels)?;

        let archive_cutoff = self.clock.now() - chrono::Duration::days(self.hot_tier.retention_days as i64);
        let needs_archive = range.start < archive_cutoff;

        let (mut points, truncated) = match request.aggregation {
            Aggregation::Raw => {
                let raw = self.storage.read_raw(metric.id, range, &labels, limit).await?;
                let mut points: Vec<DataPoint> = raw
                    .into_iter()
                    .map(|(timestamp, value, labels)| DataPoint { timestamp, value, labels })
                    .collect();
                if needs_archive {
                    let archived = self.archive.query_archive(metric.id, range).await?;
                    points.extend(
                        archived
                            .into_iter()
                            .map(|(timestamp, value, labels)| DataPoint { timestamp, value, labels }),
                    );
                }
                points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                points.dedup_by(|a, b| a.timestamp == b.timestamp);
                let truncated = points.len() as u64 > limit;
                points.truncate(limit as usize);
                (points, truncated)
            }
            Aggregation::Rate => {
                if metric.kind != crate::models::metric::MetricKind::Counter {
                    return Err(EngineError::BadInput(format!(
                        "RATE requires a COUNTER metric, '{}' is {:?}",
                        metric.name, metric.kind
                    )));
                }
                let mut rates = self.rate_engine.rate(metric.id, range, &labels, limit).await?;
                rates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                let truncated = rates.len() as u64 > limit;
                rates.truncate(limit as usize);
                (rates, truncated)
            }
            agg if agg.is_percentile() => {
                let quantile = agg.percentile_quantile().unwrap();
                let value = self.storage.percentile(quantile, metric.id, range, &labels).await?;
                let points = value
                    .map(|value| {
                        vec![DataPoint {
                            timestamp: range.end,
                            value,
                            labels: labels.clone(),
                        }]
                    })
                    .unwrap_or_default();
                (points, false)
            }
            agg if agg.is_bucketable() => {
                let fut = self.run_bucketed(agg, metric.id, range, &labels, request.interval_seconds);
                let timeout = std::time::Duration::from_secs(self.query.bucket_hard_timeout_secs);
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result?,
                    Err(_) => {
                        return Err(EngineError::Transient(
                            "bucketed query exceeded the hard timeout; widen the interval or narrow the range"
                                .to_string(),
                        ));
                    }
                }
            }
            other => {
                return Err(EngineError::Fatal(format!("unhandled aggregation {other:?}")));
            }
        };

        points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(QueryResponse {
            metric_name: metric.name,
            aggregation: request.aggregation,
            points: std::mem::take(&mut points),
            truncated,
            served_from_archive: needs_archive,
        })
    }

    async fn run_bucketed(
        &self,
        agg: Aggregation,
        metric_id: Uuid,
        range: TimeRange,
        labels: &BTreeMap<String, String>,
        interval_seconds: Option<u64>,
    ) -> EngineResult<(Vec<DataPoint>, bool)> {
        match interval_seconds {
            Some(interval) => {
                let rows = self.storage.bucket(interval, metric_id, range, labels, self.query.bucket_cap).await?;
                let truncated = rows.len() >= self.query.bucket_cap;
                let points = rows.into_iter().map(|row| DataPoint {
                    timestamp: row.bucket_start,
                    value: pick_stat(agg, &row),
                    labels: labels.clone(),
                }).collect();
                Ok((points, truncated))
            }
            None => {
                // A single bucket spanning the whole range: pull the pre-aggregated
                // rows the range decomposes into and fold them into one value.
                let span_seconds = range.duration().num_seconds().max(1) as u64;
                let rows = self.storage.bucket(span_seconds, metric_id, range, labels, self.query.bucket_cap).await?;
                let folded = fold_buckets(&rows);
                let points = match folded {
                    Some(row) => vec![DataPoint {
                        timestamp: range.end,
                        value: pick_stat(agg, &row),
                        labels: labels.clone(),
                    }],
                    None => vec![],
                };
                Ok((points, false))
            }
        }
    }

    fn resolve_range(&self, range: TimeRange) -> EngineResult<TimeRange> {
        range.validate().map_err(EngineError::BadInput)?;
        let span_days = range.duration().num_seconds() as f64 / 86_400.0;
        if span_days > MAX_QUERY_SPAN_DAYS as f64 {
            return Err(EngineError::BadInput(format!(
                "query span exceeds the {MAX_QUERY_SPAN_DAYS}d maximum"
            )));
        }
        Ok(range)
    }

    /// Only equality predicates are pushed down; the store matches the whole
    /// label set as one string, so a `!=` filter can't be expressed as a
    /// partial match and is rejected rather than silently ignored.
    fn equality_labels(&self, filters: &[crate::models::query::LabelFilter]) -> EngineResult<BTreeMap<String, String>> {
        let mut map = BTreeMap::new();
        for filter in filters {
            match filter.op {
                FilterOp::Eq => {
                    map.insert(filter.key.clone(), filter.value.clone());
                }
                FilterOp::Ne => {
                    return Err(EngineError::BadInput(
                        "label inequality filters are not supported by this store".to_string(),
                    ));
                }
            }
        }
        Ok(map)
    }
}

fn pick_stat(agg: Aggregation, row: &BucketRow) -> f64 {
    match agg {
        Aggregation::Sum => row.sum,
        Aggregation::Avg => row.avg,
        Aggregation::Min => row.min,
        Aggregation::Max => row.max,
        Aggregation::Count => row.count as f64,
        _ => row.avg,
    }
}

fn fold_buckets(rows: &[BucketRow]) -> Option<BucketRow> {
    if rows.is_empty() {
        return None;
    }
    let count: u64 = rows.iter().map(|r| r.count).sum();
    let sum: f64 = rows.iter().map(|r| r.sum).sum();
    let min = rows.iter().map(|r| r.min).fold(f64::INFINITY, f64::min);
    let max = rows.iter().map(|r| r.max).fold(f64::NEG_INFINITY, f64::max);
    let avg = if count > 0 { sum / count as f64 } else { 0.0 };
    Some(BucketRow {
        bucket_start: rows[0].bucket_start,
        avg,
        sum,
        min,
        max,
        count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::models::metric::{MetricDefinition, MetricFilter, MetricKind};
    use crate::models::query::LabelFilter;
    use crate::models::sample::ResolvedSample;
    use crate::registry::MetricStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryMetricStore {
        by_id: Mutex<std::collections::HashMap<Uuid, crate::models::metric::Metric>>,
    }

    #[async_trait]
    impl MetricStore for InMemoryMetricStore {
        async fn find_by_name(&self, name: &str) -> EngineResult<Option<crate::models::metric::Metric>> {
            Ok(self.by_id.lock().unwrap().values().find(|m| m.name == name).cloned())
        }
        async fn find_by_id(&self, id: Uuid) -> EngineResult<Option<crate::models::metric::Metric>> {
            Ok(self.by_id.lock().unwrap().get(&id).cloned())
        }
        async fn list(&self, _filter: &MetricFilter) -> EngineResult<Vec<crate::models::metric::Metric>> {
            Ok(self.by_id.lock().unwrap().values().cloned().collect())
        }
        async fn insert(&self, metric: &crate::models::metric::Metric) -> EngineResult<()> {
            self.by_id.lock().unwrap().insert(metric.id, metric.clone());
            Ok(())
        }
        async fn save(&self, metric: &crate::models::metric::Metric) -> EngineResult<()> {
            self.by_id.lock().unwrap().insert(metric.id, metric.clone());
            Ok(())
        }
    }

    struct StubStorage {
        raw: Vec<(DateTime<Utc>, f64, BTreeMap<String, String>)>,
        buckets: Vec<BucketRow>,
    }

    #[async_trait]
    impl StorageGateway for StubStorage {
        async fn upsert(&self, _sample: &ResolvedSample) -> EngineResult<()> {
            Ok(())
        }
        async fn upsert_batch(&self, _samples: &[ResolvedSample]) -> EngineResult<()> {
            Ok(())
        }
        async fn read_raw(
            &self,
            _metric_id: Uuid,
            _range: TimeRange,
            _labels: &BTreeMap<String, String>,
            _limit: u64,
        ) -> EngineResult<Vec<(DateTime<Utc>, f64, BTreeMap<String, String>)>> {
            Ok(self.raw.clone())
        }
        async fn bucket(
            &self,
            _interval_seconds: u64,
            _metric_id: Uuid,
            _range: TimeRange,
            _labels: &BTreeMap<String, String>,
            _cap: usize,
        ) -> EngineResult<Vec<BucketRow>> {
            Ok(self.buckets.clone())
        }
        async fn percentile(
            &self,
            _quantile: f64,
            _metric_id: Uuid,
            _range: TimeRange,
            _labels: &BTreeMap<String, String>,
        ) -> EngineResult<Option<f64>> {
            Ok(Some(95.0))
        }
        async fn count_distinct_label_combinations(
            &self,
            _metric_id: Uuid,
            _since: DateTime<Utc>,
        ) -> EngineResult<u64> {
            Ok(0)
        }
        async fn delete_by_range_batched(&self, _metric_id: Uuid, _range: TimeRange, _batch_size: u64) -> EngineResult<u64> {
            Ok(0)
        }
        async fn find_distinct_metrics_before(&self, _cutoff: DateTime<Utc>) -> EngineResult<Vec<Uuid>> {
            Ok(vec![])
        }
        async fn request_vacuum(&self) -> EngineResult<()> {
            Ok(())
        }
    }

    struct NoArchive;
    #[async_trait]
    impl ArchiveReader for NoArchive {
        async fn query_archive(
            &self,
            _metric_id: Uuid,
            _range: TimeRange,
        ) -> EngineResult<Vec<(DateTime<Utc>, f64, BTreeMap<String, String>)>> {
            Ok(vec![])
        }
    }

    fn range(start_secs: i64, end_secs: i64) -> TimeRange {
        let base = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        TimeRange {
            start: base + chrono::Duration::seconds(start_secs),
            end: base + chrono::Duration::seconds(end_secs),
        }
    }

    async fn planner(storage: StubStorage) -> (QueryPlanner, Arc<MetricRegistry>, FixedClock) {
        let clock = FixedClock::new(DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z").unwrap().with_timezone(&Utc));
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let registry = Arc::new(MetricRegistry::new(Arc::new(InMemoryMetricStore::default()), clock_arc.clone()));
        let storage: Arc<dyn StorageGateway> = Arc::new(storage);
        let rate_engine = Arc::new(RateEngine::new(storage.clone(), registry.clone()));
        let planner = QueryPlanner::new(
            registry.clone(),
            storage,
            rate_engine,
            Arc::new(NoArchive),
            clock_arc,
            HotTierConfig {
                retention_days: 10,
                compression_after_days: 7,
            },
            QueryConfig {
                default_limit: 100,
                max_limit: 10_000,
                timeout_seconds: 30,
                bucket_cap: 1_000,
                bucket_hard_timeout_secs: 5,
            },
        );
        (planner, registry, clock)
    }

    #[tokio::test]
    async fn raw_query_returns_points_newest_first() {
        let base = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let (planner, registry, _clock) = planner(StubStorage {
            raw: vec![
                (base, 1.0, BTreeMap::new()),
                (base + chrono::Duration::seconds(10), 2.0, BTreeMap::new()),
            ],
            buckets: vec![],
        })
        .await;
        registry
            .register(MetricDefinition {
                name: "cpu".to_string(),
                kind: MetricKind::Gauge,
                description: None,
                unit: None,
                retention_days: 30,
                labels: Default::default(),
            })
            .await
            .unwrap();

        let resp = planner
            .execute(QueryRequest {
                metric_name: "cpu".to_string(),
                range: range(-60, 3600),
                labels: vec![],
                aggregation: Aggregation::Raw,
                interval_seconds: None,
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(resp.points.len(), 2);
        assert!(resp.points[0].timestamp > resp.points[1].timestamp);
    }

    #[tokio::test]
    async fn rate_on_non_counter_is_bad_input() {
        let (planner, registry, _clock) = planner(StubStorage { raw: vec![], buckets: vec![] }).await;
        registry
            .register(MetricDefinition {
                name: "gauge.metric".to_string(),
                kind: MetricKind::Gauge,
                description: None,
                unit: None,
                retention_days: 30,
                labels: Default::default(),
            })
            .await
            .unwrap();

        let err = planner
            .execute(QueryRequest {
                metric_name: "gauge.metric".to_string(),
                range: range(0, 3600),
                labels: vec![],
                aggregation: Aggregation::Rate,
                interval_seconds: None,
                limit: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BAD_INPUT");
    }

    #[tokio::test]
    async fn percentile_returns_single_point_at_range_end() {
        let (planner, registry, _clock) = planner(StubStorage { raw: vec![], buckets: vec![] }).await;
        registry
            .register(MetricDefinition {
                name: "lat".to_string(),
                kind: MetricKind::Gauge,
                description: None,
                unit: None,
                retention_days: 30,
                labels: Default::default(),
            })
            .await
            .unwrap();
        let r = range(0, 3600);
        let resp = planner
            .execute(QueryRequest {
                metric_name: "lat".to_string(),
                range: r,
                labels: vec![],
                aggregation: Aggregation::P95,
                interval_seconds: None,
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(resp.points.len(), 1);
        assert_eq!(resp.points[0].timestamp, r.end);
        assert_eq!(resp.points[0].value, 95.0);
    }

    #[tokio::test]
    async fn inequality_label_filter_is_rejected() {
        let (planner, registry, _clock) = planner(StubStorage { raw: vec![], buckets: vec![] }).await;
        registry
            .register(MetricDefinition {
                name: "m".to_string(),
                kind: MetricKind::Gauge,
                description: None,
                unit: None,
                retention_days: 30,
                labels: Default::default(),
            })
            .await
            .unwrap();
        let err = planner
            .execute(QueryRequest {
                metric_name: "m".to_string(),
                range: range(0, 3600),
                labels: vec![LabelFilter {
                    key: "host".to_string(),
                    op: FilterOp::Ne,
                    value: "a".to_string(),
                }],
                aggregation: Aggregation::Raw,
                interval_seconds: None,
                limit: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BAD_INPUT");
    }
}
