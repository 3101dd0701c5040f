use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::ColdTierConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::archive::{ArchiveFormat, ArchiveSegment};
use crate::models::query::TimeRange;
use crate::object_store::ObjectStore;
use crate::query_planner::ArchiveReader;
use crate::registry::MetricRegistry;
use crate::storage::StorageGateway;

/// One element of an archived segment's JSON array, per the object-store
/// contract: labels are stored as a nested JSON-encoded string, not a native
/// object, for format stability across a future reader migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ArchivedRow {
    timestamp: i64,
    metric_id: Uuid,
    value: f64,
    labels: String,
}

/// Persistence for `cold_storage_metadata`, kept separate from `StorageGateway`
/// since it describes the archive index, not the hot hypertable.
#[async_trait]
pub trait ArchiveMetadataStore: Send + Sync {
    async fn find_segment(&self, metric_id: Uuid, day_start: DateTime<Utc>) -> EngineResult<Option<ArchiveSegment>>;
    async fn insert_segment(&self, segment: &ArchiveSegment) -> EngineResult<()>;
    async fn find_overlapping(&self, metric_id: Uuid, range: TimeRange) -> EngineResult<Vec<ArchiveSegment>>;
}

#[derive(Debug, Clone, Deserialize, clickhouse::Row)]
struct SegmentRow {
    #[serde(with = "clickhouse::serde::uuid")]
    id: Uuid,
    #[serde(with = "clickhouse::serde::uuid")]
    metric_id: Uuid,
    metric_name: String,
    #[serde(with = "clickhouse::serde::time::datetime")]
    start_time: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::time::datetime")]
    end_time: DateTime<Utc>,
    object_path: String,
    file_format: String,
    file_size_bytes: u64,
    row_count: u64,
    compression_ratio: f64,
    labels_index: String,
    #[serde(with = "clickhouse::serde::time::datetime")]
    created_at: DateTime<Utc>,
}

impl From<SegmentRow> for ArchiveSegment {
    fn from(r: SegmentRow) -> Self {
        ArchiveSegment {
            id: r.id,
            metric_id: r.metric_id,
            metric_name: r.metric_name,
            start_time: r.start_time,
            end_time: r.end_time,
            object_path: r.object_path,
            file_format: r.file_format,
            file_size_bytes: r.file_size_bytes,
            row_count: r.row_count,
            compression_ratio: r.compression_ratio,
            labels_index: r.labels_index,
            created_at: r.created_at,
        }
    }
}

pub struct ClickHouseArchiveMetadataStore {
    client: clickhouse::Client,
}

impl ClickHouseArchiveMetadataStore {
    pub fn new(client: clickhouse::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ArchiveMetadataStore for ClickHouseArchiveMetadataStore {
    async fn find_segment(&self, metric_id: Uuid, day_start: DateTime<Utc>) -> EngineResult<Option<ArchiveSegment>> {
        let rows: Vec<SegmentRow> = self
            .client
            .query(
                "SELECT id, metric_id, metric_name, start_time, end_time, object_path, file_format, \
                        file_size_bytes, row_count, compression_ratio, labels_index, created_at \
                 FROM metrics.cold_storage_metadata WHERE metric_id = ? AND start_time = ? LIMIT 1",
            )
            .bind(metric_id)
            .bind(day_start)
            .fetch_all()
            .await
            .map_err(EngineError::from)?;
        Ok(rows.into_iter().next().map(ArchiveSegment::from))
    }

    async fn insert_segment(&self, segment: &ArchiveSegment) -> EngineResult<()> {
        let mut insert = self
            .client
            .insert("metrics.cold_storage_metadata")
            .map_err(EngineError::from)?;
        insert.write(segment).await.map_err(EngineError::from)?;
        insert.end().await.map_err(EngineError::from)?;
        Ok(())
    }

    async fn find_overlapping(&self, metric_id: Uuid, range: TimeRange) -> EngineResult<Vec<ArchiveSegment>> {
        let rows: Vec<SegmentRow> = self
            .client
            .query(
                "SELECT id, metric_id, metric_name, start_time, end_time, object_path, file_format, \
                        file_size_bytes, row_count, compression_ratio, labels_index, created_at \
                 FROM metrics.cold_storage_metadata \
                 WHERE metric_id = ? AND start_time < ? AND end_time > ? ORDER BY start_time ASC",
            )
            .bind(metric_id)
            .bind(range.end)
            .bind(range.start)
            .fetch_all()
            .await
            .map_err(EngineError::from)?;
        Ok(rows.into_iter().map(ArchiveSegment::from).collect())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ArchivalStats {
    pub segments_written: u64,
    pub rows_archived: u64,
    pub rows_deleted: u64,
    pub errors: Vec<String>,
}

/// Scheduled sweep that moves samples older than the cold-tier cutoff out of
/// the hot store into gzip-compressed JSON objects, one per (metric, day).
pub struct ArchivalEngine {
    storage: Arc<dyn StorageGateway>,
    object_store: Arc<dyn ObjectStore>,
    metadata: Arc<dyn ArchiveMetadataStore>,
    registry: Arc<MetricRegistry>,
    clock: Arc<dyn Clock>,
    config: ColdTierConfig,
    running: AtomicBool,
}

impl ArchivalEngine {
    pub fn new(
        storage: Arc<dyn StorageGateway>,
        object_store: Arc<dyn ObjectStore>,
        metadata: Arc<dyn ArchiveMetadataStore>,
        registry: Arc<MetricRegistry>,
        clock: Arc<dyn Clock>,
        config: ColdTierConfig,
    ) -> Self {
        Self {
            storage,
            object_store,
            metadata,
            registry,
            clock,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Runs the full sweep once. A second concurrent caller is turned away
    /// immediately by the compare-and-set on `running`; the job never throws,
    /// it records errors in the returned stats instead.
    pub async fn run_archival_job(&self) -> ArchivalStats {
        if !self.config.enabled {
            return ArchivalStats::default();
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("archival job already in progress, skipping this trigger");
            return ArchivalStats::default();
        }

        let stats = self.run_inner().await;
        self.running.store(false, Ordering::SeqCst);
        stats
    }

    async fn run_inner(&self) -> ArchivalStats {
        let mut stats = ArchivalStats::default();
        let cutoff = self.clock.now() - chrono::Duration::days(self.config.retention_days as i64);

        let metric_ids = match self.storage.find_distinct_metrics_before(cutoff).await {
            Ok(ids) => ids,
            Err(e) => {
                stats.errors.push(format!("failed to list metrics before cutoff: {e}"));
                return stats;
            }
        };

        for group in metric_ids.chunks(self.config.max_concurrent_uploads.max(1)) {
            let results = futures_util::future::join_all(
                group.iter().map(|&metric_id| self.archive_metric(metric_id, cutoff)),
            )
            .await;
            for result in results {
                match result {
                    Ok(metric_stats) => {
                        stats.segments_written += metric_stats.segments_written;
                        stats.rows_archived += metric_stats.rows_archived;
                        stats.rows_deleted += metric_stats.rows_deleted;
                        stats.errors.extend(metric_stats.errors);
                    }
                    Err(e) => stats.errors.push(e.to_string()),
                }
            }
        }

        if stats.rows_archived > self.config.vacuum_threshold_rows {
            tracing::info!(
                rows_archived = stats.rows_archived,
                "archived rows exceeded vacuum threshold, requesting incremental vacuum"
            );
            if let Err(e) = self.storage.request_vacuum().await {
                tracing::warn!("post-archival vacuum request failed (non-fatal): {e}");
            }
        }

        stats
    }

    async fn archive_metric(&self, metric_id: Uuid, cutoff: DateTime<Utc>) -> EngineResult<ArchivalStats> {
        let mut stats = ArchivalStats::default();
        let metric_name = self
            .registry
            .get_by_id(metric_id)
            .await?
            .map(|m| m.name)
            .unwrap_or_else(|| metric_id.to_string());

        let today = day_start(self.clock.now());
        let mut day = day_start(cutoff);
        while day < today {
            let day_range = TimeRange {
                start: day,
                end: day + chrono::Duration::days(1),
            };

            if self.metadata.find_segment(metric_id, day).await?.is_some() {
                day += chrono::Duration::days(1);
                continue;
            }

            match self.archive_one_day(metric_id, &metric_name, day_range).await {
                Ok(Some(day_stats)) => {
                    stats.segments_written += day_stats.segments_written;
                    stats.rows_archived += day_stats.rows_archived;
                    stats.rows_deleted += day_stats.rows_deleted;
                }
                Ok(None) => {}
                Err(e) => stats.errors.push(format!("metric {metric_id} day {day}: {e}")),
            }

            tokio::time::sleep(std::time::Duration::from_millis(self.config.delay_between_batches_ms)).await;
            day += chrono::Duration::days(1);
        }

        Ok(stats)
    }

    /// Pages through a single calendar day's samples, packs them into one
    /// gzip object, records the metadata row, then cleans up the hot store.
    /// Returns `None` when the day has no rows (no segment is written for an
    /// empty day).
    async fn archive_one_day(
        &self,
        metric_id: Uuid,
        metric_name: &str,
        range: TimeRange,
    ) -> EngineResult<Option<ArchivalStats>> {
        let mut rows: Vec<ArchivedRow> = Vec::new();
        let mut labels_seen: BTreeMap<String, String> = BTreeMap::new();
        let mut cursor = range.start;

        loop {
            let page = self
                .storage
                .read_raw(metric_id, TimeRange { start: cursor, end: range.end }, &BTreeMap::new(), self.config.batch_size as u64)
                .await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            for (timestamp, value, labels) in &page {
                for (k, v) in labels {
                    labels_seen.insert(k.clone(), v.clone());
                }
                rows.push(ArchivedRow {
                    timestamp: timestamp.timestamp_millis(),
                    metric_id,
                    value: *value,
                    labels: crate::storage::encode_labels(labels),
                });
            }
            if page_len < self.config.batch_size {
                break;
            }
            cursor = page.last().unwrap().0 + chrono::Duration::milliseconds(1);
        }

        if rows.is_empty() {
            return Ok(None);
        }

        let row_count = rows.len() as u64;
        let json = serde_json::to_vec(&rows).map_err(|e| EngineError::Fatal(format!("archive serialize failed: {e}")))?;
        let raw_size = json.len() as u64;
        let compressed = gzip(&json)?;
        let compressed_size = compressed.len() as u64;

        let object_key = ArchiveSegment::object_key(metric_id, range.start, ArchiveFormat::JsonGz);
        self.object_store
            .put_object(&self.config.bucket, &object_key, compressed, "application/gzip")
            .await?;

        let segment = ArchiveSegment {
            id: Uuid::new_v4(),
            metric_id,
            metric_name: metric_name.to_string(),
            start_time: range.start,
            end_time: range.end,
            object_path: object_key,
            file_format: ArchiveFormat::JsonGz.extension().to_string(),
            file_size_bytes: compressed_size,
            row_count,
            compression_ratio: if compressed_size > 0 { raw_size as f64 / compressed_size as f64 } else { 1.0 },
            labels_index: serde_json::to_string(&labels_seen).unwrap_or_else(|_| "{}".to_string()),
            created_at: self.clock.now(),
        };
        self.metadata.insert_segment(&segment).await?;

        let mut rows_deleted = 0;
        // Delete failure is logged but must not fail the archival of this day;
        // cleanup is retried on the next run since the segment already exists.
        match self.storage.delete_by_range_batched(metric_id, range, self.config.batch_size as u64).await {
            Ok(deleted) => rows_deleted = deleted,
            Err(e) => tracing::warn!("hot-store cleanup for metric {metric_id} day {} failed: {e}", range.start),
        }

        Ok(Some(ArchivalStats {
            segments_written: 1,
            rows_archived: row_count,
            rows_deleted,
            errors: vec![],
        }))
    }
}

#[async_trait]
impl ArchiveReader for ArchivalEngine {
    /// Looks up overlapping segments, downloads and decompresses each,
    /// filters to the requested range, and concatenates them ordered by time.
    /// A segment that fails to parse is logged and contributes no rows;
    /// others continue.
    async fn query_archive(
        &self,
        metric_id: Uuid,
        range: TimeRange,
    ) -> EngineResult<Vec<(DateTime<Utc>, f64, BTreeMap<String, String>)>> {
        let segments = self.metadata.find_overlapping(metric_id, range).await?;
        let mut out = Vec::new();
        for segment in segments {
            let compressed = match self.object_store.get_object(&self.config.bucket, &segment.object_path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("failed to download archive segment {}: {e}", segment.object_path);
                    continue;
                }
            };
            let rows = match decode_segment(&compressed) {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!("failed to parse archive segment {}: {e}", segment.object_path);
                    continue;
                }
            };
            for row in rows {
                let ts = Utc.timestamp_millis_opt(row.timestamp).single();
                if let Some(ts) = ts {
                    if ts >= range.start && ts < range.end {
                        out.push((ts, row.value, crate::storage::decode_labels(&row.labels)));
                    }
                }
            }
        }
        out.sort_by_key(|(t, _, _)| *t);
        Ok(out)
    }
}

fn day_start(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc()
}

fn gzip(data: &[u8]) -> EngineResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| EngineError::Fatal(format!("gzip write failed: {e}")))?;
    encoder.finish().map_err(|e| EngineError::Fatal(format!("gzip finish failed: {e}")))
}

/// On parse failure the whole file is treated as empty, per the archive
/// format's documented failure mode.
fn decode_segment(compressed: &[u8]) -> Result<Vec<ArchivedRow>, String> {
    let mut decoder = GzDecoder::new(compressed);
    let mut json = String::new();
    decoder.read_to_string(&mut json).map_err(|e| e.to_string())?;
    serde_json::from_str(&json).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::models::metric::MetricFilter;
    use crate::models::sample::ResolvedSample;
    use crate::object_store::InMemoryObjectStore;
    use std::sync::Mutex;

    struct InMemoryStorage {
        samples: Mutex<Vec<(Uuid, DateTime<Utc>, f64, BTreeMap<String, String>)>>,
        deleted: AtomicU64,
    }

    #[async_trait]
    impl StorageGateway for InMemoryStorage {
        async fn upsert(&self, _sample: &ResolvedSample) -> EngineResult<()> {
            Ok(())
        }
        async fn upsert_batch(&self, _samples: &[ResolvedSample]) -> EngineResult<()> {
            Ok(())
        }
        async fn read_raw(
            &self,
            metric_id: Uuid,
            range: TimeRange,
            _labels: &BTreeMap<String, String>,
            limit: u64,
        ) -> EngineResult<Vec<(DateTime<Utc>, f64, BTreeMap<String, String>)>> {
            let mut rows: Vec<_> = self
                .samples
                .lock()
                .unwrap()
                .iter()
                .filter(|(id, t, _, _)| *id == metric_id && *t >= range.start && *t < range.end)
                .map(|(_, t, v, l)| (*t, *v, l.clone()))
                .collect();
            rows.sort_by_key(|(t, _, _)| *t);
            rows.truncate(limit as usize);
            Ok(rows)
        }
        async fn bucket(
            &self,
            _interval_seconds: u64,
            _metric_id: Uuid,
            _range: TimeRange,
            _labels: &BTreeMap<String, String>,
            _cap: usize,
        ) -> EngineResult<Vec<crate::models::query::BucketRow>> {
            Ok(vec![])
        }
        async fn percentile(
            &self,
            _quantile: f64,
            _metric_id: Uuid,
            _range: TimeRange,
            _labels: &BTreeMap<String, String>,
        ) -> EngineResult<Option<f64>> {
            Ok(None)
        }
        async fn count_distinct_label_combinations(&self, _metric_id: Uuid, _since: DateTime<Utc>) -> EngineResult<u64> {
            Ok(0)
        }
        async fn delete_by_range_batched(&self, metric_id: Uuid, range: TimeRange, _batch_size: u64) -> EngineResult<u64> {
            let mut samples = self.samples.lock().unwrap();
            let before = samples.len();
            samples.retain(|(id, t, _, _)| !(*id == metric_id && *t >= range.start && *t < range.end));
            let deleted = (before - samples.len()) as u64;
            self.deleted.fetch_add(deleted, Ordering::Relaxed);
            Ok(deleted)
        }
        async fn find_distinct_metrics_before(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Uuid>> {
            Ok(self
                .samples
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, t, _, _)| *t < cutoff)
                .map(|(id, _, _, _)| *id)
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect())
        }
        async fn request_vacuum(&self) -> EngineResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct InMemoryMetadataStore {
        segments: Mutex<Vec<ArchiveSegment>>,
    }

    #[async_trait]
    impl ArchiveMetadataStore for InMemoryMetadataStore {
        async fn find_segment(&self, metric_id: Uuid, day_start: DateTime<Utc>) -> EngineResult<Option<ArchiveSegment>> {
            Ok(self
                .segments
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.metric_id == metric_id && s.start_time == day_start)
                .cloned())
        }
        async fn insert_segment(&self, segment: &ArchiveSegment) -> EngineResult<()> {
            self.segments.lock().unwrap().push(segment.clone());
            Ok(())
        }
        async fn find_overlapping(&self, metric_id: Uuid, range: TimeRange) -> EngineResult<Vec<ArchiveSegment>> {
            Ok(self
                .segments
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.metric_id == metric_id && s.start_time < range.end && s.end_time > range.start)
                .cloned()
                .collect())
        }
    }

    fn cold_tier_config() -> ColdTierConfig {
        ColdTierConfig {
            enabled: true,
            retention_days: 30,
            batch_size: 5000,
            delay_between_batches_ms: 0,
            max_concurrent_uploads: 3,
            vacuum_threshold_rows: 100_000,
            cron: "0 0 2 * * ?".to_string(),
            bucket: "metric-archive".to_string(),
        }
    }

    #[tokio::test]
    async fn archives_a_day_and_cleans_up_hot_store() {
        let now = DateTime::parse_from_rfc3339("2026-03-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now));
        let metric_id = Uuid::new_v4();
        let archived_day = day_start(now - chrono::Duration::days(35));

        let storage = Arc::new(InMemoryStorage {
            samples: Mutex::new(vec![(
                metric_id,
                archived_day + chrono::Duration::hours(1),
                42.0,
                BTreeMap::from([("host".to_string(), "a".to_string())]),
            )]),
            deleted: AtomicU64::new(0),
        });
        let object_store = Arc::new(InMemoryObjectStore::with_bucket("metric-archive"));
        let metadata = Arc::new(InMemoryMetadataStore::default());
        let registry = Arc::new(MetricRegistry::new(
            Arc::new(NullMetricStore),
            clock.clone(),
        ));

        let engine = ArchivalEngine::new(
            storage.clone() as Arc<dyn StorageGateway>,
            object_store.clone() as Arc<dyn ObjectStore>,
            metadata.clone() as Arc<dyn ArchiveMetadataStore>,
            registry,
            clock,
            cold_tier_config(),
        );

        let stats = engine.run_archival_job().await;
        assert_eq!(stats.segments_written, 1);
        assert_eq!(stats.rows_archived, 1);
        assert!(stats.errors.is_empty());
        assert_eq!(storage.deleted.load(Ordering::Relaxed), 1);

        let range = TimeRange {
            start: archived_day,
            end: archived_day + chrono::Duration::days(1),
        };
        let back = engine.query_archive(metric_id, range).await.unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].1, 42.0);
        assert_eq!(back[0].2.get("host"), Some(&"a".to_string()));
    }

    #[tokio::test]
    async fn second_concurrent_run_is_turned_away() {
        let now = Utc::now();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(now));
        let storage = Arc::new(InMemoryStorage {
            samples: Mutex::new(vec![]),
            deleted: AtomicU64::new(0),
        });
        let engine = Arc::new(ArchivalEngine::new(
            storage as Arc<dyn StorageGateway>,
            Arc::new(InMemoryObjectStore::with_bucket("metric-archive")),
            Arc::new(InMemoryMetadataStore::default()),
            Arc::new(MetricRegistry::new(Arc::new(NullMetricStore), clock.clone())),
            clock,
            cold_tier_config(),
        ));
        engine.running.store(true, Ordering::SeqCst);
        let stats = engine.run_archival_job().await;
        assert_eq!(stats.segments_written, 0);
    }

    struct NullMetricStore;
    #[async_trait]
    impl crate::registry::MetricStore for NullMetricStore {
        async fn find_by_name(&self, _name: &str) -> EngineResult<Option<crate::models::metric::Metric>> {
            Ok(None)
        }
        async fn find_by_id(&self, _id: Uuid) -> EngineResult<Option<crate::models::metric::Metric>> {
            Ok(None)
        }
        async fn list(&self, _filter: &MetricFilter) -> EngineResult<Vec<crate::models::metric::Metric>> {
            Ok(vec![])
        }
        async fn insert(&self, _metric: &crate::models::metric::Metric) -> EngineResult<()> {
            Ok(())
        }
        async fn save(&self, _metric: &crate::models::metric::Metric) -> EngineResult<()> {
            Ok(())
        }
    }
}
