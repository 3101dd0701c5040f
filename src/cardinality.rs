use chrono::{DateTime, Utc};
use governor::{Quota, RateLimiter};
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::Mutex;
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::CardinalityConfig;
use crate::error::{EngineError, EngineResult};
use crate::models::metric::{validate_label_key, validate_label_value};
use crate::storage::StorageGateway;

/// Substrings that mark a label key as likely-unbounded-cardinality. Matching
/// only raises a warning; it never blocks ingest on its own.
const HIGH_CARDINALITY_PATTERNS: &[&str] = &[
    "id", "uuid", "guid", "session", "request", "transaction", "user", "customer", "account",
    "email", "username", "ip", "address", "timestamp", "datetime", "random", "nonce", "token",
];

#[derive(Debug, Clone, Default)]
pub struct CardinalityReport {
    pub warnings: Vec<String>,
}

/// Per-metric current-cardinality estimate, cached for `probe_cache_ttl_secs`.
struct CacheEntry {
    count: u64,
    fetched_at: DateTime<Utc>,
}

type GlobalLimiter = RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, governor::clock::DefaultClock>;

/// Label-shape validation, high-cardinality pattern warnings, and the
/// rate-limited current-cardinality check that guards the hard cap.
pub struct CardinalityGuard {
    storage: Arc<dyn StorageGateway>,
    clock: Arc<dyn Clock>,
    config: CardinalityConfig,
    cache: Mutex<BTreeMap<Uuid, CacheEntry>>,
    limiter: GlobalLimiter,
}

impl CardinalityGuard {
    pub fn new(storage: Arc<dyn StorageGateway>, clock: Arc<dyn Clock>, config: CardinalityConfig) -> Self {
        let per_minute = NonZeroU32::new(config.probe_rate_per_min.max(1)).unwrap();
        let quota = Quota::per_minute(per_minute);
        Self {
            storage,
            clock,
            config,
            cache: Mutex::new(BTreeMap::new()),
            limiter: RateLimiter::direct(quota),
        }
    }

    /// Validate a candidate sample's label set against shape rules and the
    /// current cardinality estimate for `metric_id`. Returns warnings on
    /// success; errors reject the sample outright.
    pub async fn validate(
        &self,
        metric_id: Uuid,
        labels: &BTreeMap<String, String>,
    ) -> EngineResult<CardinalityReport> {
        if labels.len() > self.config.max_labels_per_metric {
            return Err(EngineError::BadInput(format!(
                "sample has {} labels, exceeds max {}",
                labels.len(),
                self.config.max_labels_per_metric
            )));
        }

        let mut warnings = Vec::new();
        for (key, value) in labels {
            validate_label_key(key).map_err(EngineError::BadInput)?;
            if value.len() > self.config.max_label_value_length {
                return Err(EngineError::BadInput(format!(
                    "label '{key}' value exceeds {} characters",
                    self.config.max_label_value_length
                )));
            }
            validate_label_value(key, value).map_err(EngineError::BadInput)?;
            if HIGH_CARDINALITY_PATTERNS
                .iter()
                .any(|pattern| key.to_ascii_lowercase().contains(pattern))
            {
                warnings.push(format!("label '{key}' matches a known high-cardinality pattern"));
            }
        }

        let current = self.current_cardinality(metric_id).await;
        let cap = self.config.max_series_per_metric;
        if current >= cap {
            return Err(EngineError::ResourceExhausted(format!(
                "metric {metric_id} reached maximum cardinality ({cap})"
            )));
        }
        let warn_at = (cap as f64 * self.config.warning_threshold) as u64;
        if current > warn_at {
            warnings.push(format!(
                "metric {metric_id} cardinality {current} exceeds {:.0}% of cap {cap}",
                self.config.warning_threshold * 100.0
            ));
        }

        Ok(CardinalityReport { warnings })
    }

    /// Returns the cached estimate when present and fresh; otherwise probes
    /// the store, subject to the global rate limiter. On a rate-limited or
    /// failed probe, falls back to the cached value (0 if none) — fail-open,
    /// because the real cap enforcement above still runs against whatever
    /// count this returns.
    async fn current_cardinality(&self, metric_id: Uuid) -> u64 {
        let now = self.clock.now();
        if let Some(cached) = self.fresh_cache_entry(metric_id, now) {
            return cached;
        }
        if self.limiter.check().is_err() {
            return self.stale_cache_value(metric_id);
        }

        let since = now - chrono::Duration::hours(self.config.check_window_hours);
        match self.storage.count_distinct_label_combinations(metric_id, since).await {
            Ok(count) => {
                self.cache.lock().unwrap().insert(
                    metric_id,
                    CacheEntry {
                        count,
                        fetched_at: now,
                    },
                );
                count
            }
            Err(_) => self.stale_cache_value(metric_id),
        }
    }

    fn fresh_cache_entry(&self, metric_id: Uuid, now: DateTime<Utc>) -> Option<u64> {
        let cache = self.cache.lock().unwrap();
        let entry = cache.get(&metric_id)?;
        let age = now - entry.fetched_at;
        (age.num_seconds() < self.config.probe_cache_ttl_secs as i64).then_some(entry.count)
    }

    fn stale_cache_value(&self, metric_id: Uuid) -> u64 {
        self.cache.lock().unwrap().get(&metric_id).map(|e| e.count).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::models::query::{BucketRow, TimeRange};
    use crate::models::sample::ResolvedSample;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct StubStorage {
        count: AtomicU64,
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
            Ok(vec![])
        }
        async fn bucket(
            &self,
            _interval_seconds: u64,
            _metric_id: Uuid,
            _range: TimeRange,
            _labels: &BTreeMap<String, String>,
            _cap: usize,
        ) -> EngineResult<Vec<BucketRow>> {
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
        async fn count_distinct_label_combinations(
            &self,
            _metric_id: Uuid,
            _since: DateTime<Utc>,
        ) -> EngineResult<u64> {
            Ok(self.count.load(Ordering::SeqCst))
        }
        async fn delete_by_range_batched(
            &self,
            _metric_id: Uuid,
            _range: TimeRange,
            _batch_size: u64,
        ) -> EngineResult<u64> {
            Ok(0)
        }
        async fn find_distinct_metrics_before(&self, _cutoff: DateTime<Utc>) -> EngineResult<Vec<Uuid>> {
            Ok(vec![])
        }
        async fn request_vacuum(&self) -> EngineResult<()> {
            Ok(())
        }
    }

    fn guard(count: u64, cap: u64) -> CardinalityGuard {
        let storage = Arc::new(StubStorage {
            count: AtomicU64::new(count),
        });
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let config = CardinalityConfig {
            max_series_per_metric: cap,
            max_labels_per_metric: 10,
            max_label_value_length: 100,
            warning_threshold: 0.8,
            check_window_hours: 24,
            probe_rate_per_min: 100,
            probe_cache_ttl_secs: 3600,
        };
        CardinalityGuard::new(storage, clock, config)
    }

    #[tokio::test]
    async fn rejects_too_many_labels() {
        let g = guard(0, 10);
        let mut labels = BTreeMap::new();
        for i in 0..11 {
            labels.insert(format!("k{i}"), "v".to_string());
        }
        let err = g.validate(Uuid::new_v4(), &labels).await.unwrap_err();
        assert_eq!(err.kind(), "BAD_INPUT");
    }

    #[tokio::test]
    async fn warns_on_high_cardinality_pattern_but_accepts() {
        let g = guard(0, 10);
        let mut labels = BTreeMap::new();
        labels.insert("user_id".to_string(), "42".to_string());
        let report = g.validate(Uuid::new_v4(), &labels).await.unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("high-cardinality")));
    }

    #[tokio::test]
    async fn rejects_at_cap() {
        let g = guard(3, 3);
        let err = g.validate(Uuid::new_v4(), &BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.kind(), "RESOURCE_EXHAUSTED");
        assert!(err.to_string().contains("reached maximum cardinality"));
    }

    #[tokio::test]
    async fn warns_above_threshold_but_below_cap() {
        let g = guard(9, 10);
        let report = g.validate(Uuid::new_v4(), &BTreeMap::new()).await.unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("cardinality")));
    }

    #[tokio::test]
    async fn accepts_comfortably_below_threshold() {
        let g = guard(1, 10);
        let report = g.validate(Uuid::new_v4(), &BTreeMap::new()).await.unwrap();
        assert!(report.warnings.is_empty());
    }
}
