use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::cardinality::CardinalityGuard;
use crate::clock::Clock;
use crate::config::IngestionConfig;
use crate::error::EngineError;
use crate::models::metric::MetricKind;
use crate::models::sample::{
    validate_sample_timestamp, validate_sample_value, IngestBatch, IngestError, IngestResult, ResolvedSample,
    Sample,
};
use crate::registry::MetricRegistry;
use crate::storage::StorageGateway;

/// Samples are rejected if their timestamp is more than this far in the future.
const MAX_FUTURE_SECS: i64 = 300;

#[derive(Debug, Clone, Default)]
pub struct IngestStats {
    pub buffered: usize,
    pub accepted_total: u64,
    pub rejected_total: u64,
    pub flush_count: u64,
}

/// Validation, cardinality protection, write buffering, and scheduled batch
/// flushing. Producers call `ingest`; a single background task drains the
/// buffer on a timer or an oversize trigger, both funneling through the same
/// idempotent drain-and-write logic (re-enqueue on failure).
pub struct IngestionPipeline {
    registry: Arc<MetricRegistry>,
    cardinality: Arc<CardinalityGuard>,
    storage: Arc<dyn StorageGateway>,
    clock: Arc<dyn Clock>,
    config: IngestionConfig,
    tx: mpsc::UnboundedSender<ResolvedSample>,
    pending: Arc<AtomicUsize>,
    accepted_total: Arc<AtomicU64>,
    rejected_total: Arc<AtomicU64>,
    flush_count: Arc<AtomicU64>,
}

impl IngestionPipeline {
    pub fn new(
        registry: Arc<MetricRegistry>,
        cardinality: Arc<CardinalityGuard>,
        storage: Arc<dyn StorageGateway>,
        clock: Arc<dyn Clock>,
        config: IngestionConfig,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let accepted_total = Arc::new(AtomicU64::new(0));
        let rejected_total = Arc::new(AtomicU64::new(0));
        let flush_count = Arc::new(AtomicU64::new(0));

        let pipeline = Arc::new(Self {
            registry,
            cardinality,
            storage: storage.clone(),
            clock,
            config: config.clone(),
            tx,
            pending: pending.clone(),
            accepted_total,
            rejected_total,
            flush_count: flush_count.clone(),
        });

        tokio::spawn(flush_loop(rx, storage, config, pending, flush_count));
        pipeline
    }

    pub fn stats(&self) -> IngestStats {
        IngestStats {
            buffered: self.pending.load(Ordering::Relaxed),
            accepted_total: self.accepted_total.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
        }
    }

    /// Validate and enqueue a batch of samples. Each sample is judged
    /// independently; a bad sample never blocks its neighbors.
    pub async fn ingest(&self, batch: IngestBatch) -> Result<IngestResult, EngineError> {
        if self.pending.load(Ordering::Relaxed) + batch.samples.len() > self.config.buffer_max_size {
            return Err(EngineError::ResourceExhausted(format!(
                "ingest batch of {} would exceed buffer cap {}",
                batch.samples.len(),
                self.config.buffer_max_size
            )));
        }

        let mut result = IngestResult::default();
        for (index, sample) in batch.samples.into_iter().enumerate() {
            match self.ingest_one(sample).await {
                Ok(()) => result.accepted += 1,
                Err(reason) => {
                    result.rejected += 1;
                    result.errors.push(IngestError { index, reason });
                }
            }
        }
        self.accepted_total.fetch_add(result.accepted as u64, Ordering::Relaxed);
        self.rejected_total.fetch_add(result.rejected as u64, Ordering::Relaxed);
        Ok(result)
    }

    async fn ingest_one(&self, sample: Sample) -> Result<(), String> {
        validate_sample_value(sample.value)?;
        let now = self.clock.now();
        validate_sample_timestamp(sample.timestamp, now, MAX_FUTURE_SECS)?;

        let metric = self
            .registry
            .get_or_create(&sample.metric_name, MetricKind::Gauge)
            .await
            .map_err(|e| e.to_string())?;
        if !metric.is_active {
            return Err(format!("metric '{}' is not active", sample.metric_name));
        }

        let provided: std::collections::BTreeSet<&str> = sample.labels.keys().map(String::as_str).collect();
        let registered: std::collections::BTreeSet<&str> = metric.labels.iter().map(String::as_str).collect();
        if provided != registered {
            let extra: Vec<&str> = provided.difference(&registered).copied().collect();
            let missing: Vec<&str> = registered.difference(&provided).copied().collect();
            return Err(format!(
                "metric '{}' label schema mismatch: unexpected key(s) [{}], missing key(s) [{}]",
                sample.metric_name,
                extra.join(", "),
                missing.join(", ")
            ));
        }

        let report = self
            .cardinality
            .validate(metric.id, &sample.labels)
            .await
            .map_err(|e| e.to_string())?;
        for warning in &report.warnings {
            tracing::warn!(metric = %sample.metric_name, "{warning}");
        }

        let resolved = ResolvedSample {
            metric_id: metric.id,
            metric_name: metric.name,
            value: sample.value,
            timestamp: sample.timestamp,
            labels: sample.labels,
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(resolved)
            .map_err(|_| "ingest buffer is closed".to_string())?;
        Ok(())
    }

    /// Force an out-of-band flush, used by tests and graceful shutdown. The
    /// scheduled loop owns the channel receiver, so this just nudges nothing —
    /// draining happens only inside `flush_loop`; this is a best-effort wait
    /// for the pending count to reach zero.
    pub async fn flush_and_wait(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending.load(Ordering::Relaxed) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn flush_loop(
    mut rx: mpsc::UnboundedReceiver<ResolvedSample>,
    storage: Arc<dyn StorageGateway>,
    config: IngestionConfig,
    pending: Arc<AtomicUsize>,
    flush_count: Arc<AtomicU64>,
) {
    let mut buffer: Vec<ResolvedSample> = Vec::new();
    let mut interval = tokio::time::interval(Duration::from_millis(config.flush_interval_ms));

    loop {
        tokio::select! {
            maybe_sample = rx.recv() => {
                match maybe_sample {
                    Some(sample) => {
                        buffer.push(sample);
                        if buffer.len() >= config.batch_size {
                            drain_and_write(&mut buffer, &storage, &pending, &flush_count).await;
                        }
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                if !buffer.is_empty() {
                    drain_and_write(&mut buffer, &storage, &pending, &flush_count).await;
                }
            }
        }
    }
}

/// Drains the whole buffer into one storage write. On failure the batch is
/// put back so the next tick retries it — the write itself is an idempotent
/// upsert keyed by (time, metric_id, labels), so re-enqueue never double-counts.
async fn drain_and_write(
    buffer: &mut Vec<ResolvedSample>,
    storage: &Arc<dyn StorageGateway>,
    pending: &Arc<AtomicUsize>,
    flush_count: &Arc<AtomicU64>,
) {
    let batch = std::mem::take(buffer);
    let len = batch.len();
    match storage.upsert_batch(&batch).await {
        Ok(()) => {
            pending.fetch_sub(len, Ordering::Relaxed);
            flush_count.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::warn!("flush of {len} samples failed, re-enqueuing: {e}");
            *buffer = batch;
        }
    }
}
