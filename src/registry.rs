use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Client;
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::models::metric::{
    validate_label_schema, validate_metric_name, validate_retention_days, Metric, MetricDefinition,
    MetricFilter, MetricKind, MetricUpdate,
};

#[derive(Debug, Clone, Deserialize, clickhouse::Row)]
struct MetricRow {
    #[serde(with = "clickhouse::serde::uuid")]
    id: Uuid,
    name: String,
    kind: String,
    description: String,
    unit: String,
    retention_days: u32,
    is_active: bool,
    #[serde(with = "clickhouse::serde::time::datetime")]
    created_at: DateTime<Utc>,
    #[serde(with = "clickhouse::serde::time::datetime")]
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, clickhouse::Row)]
struct LabelKeyRow {
    label_key: String,
}

/// Persistence the registry writes through to. Kept separate from
/// `StorageGateway` because it owns the `metrics` / `metric_labels` tables,
/// not the sample hypertable.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn find_by_name(&self, name: &str) -> EngineResult<Option<Metric>>;
    async fn find_by_id(&self, id: Uuid) -> EngineResult<Option<Metric>>;
    async fn list(&self, filter: &MetricFilter) -> EngineResult<Vec<Metric>>;
    async fn insert(&self, metric: &Metric) -> EngineResult<()>;
    async fn save(&self, metric: &Metric) -> EngineResult<()>;
}

pub struct ClickHouseMetricStore {
    client: Client,
}

impl ClickHouseMetricStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn labels_of(&self, id: Uuid) -> EngineResult<BTreeSet<String>> {
        let rows: Vec<LabelKeyRow> = self
            .client
            .query("SELECT label_key FROM metrics.metric_labels WHERE metric_id = ?")
            .bind(id)
            .fetch_all()
            .await
            .map_err(EngineError::from)?;
        Ok(rows.into_iter().map(|r| r.label_key).collect())
    }

    fn row_to_metric(row: MetricRow, labels: BTreeSet<String>) -> EngineResult<Metric> {
        let kind: MetricKind = row
            .kind
            .parse()
            .map_err(|e| EngineError::Fatal(format!("stored metric {} has invalid kind: {e}", row.id)))?;
        Ok(Metric {
            id: row.id,
            name: row.name,
            kind,
            description: (!row.description.is_empty()).then_some(row.description),
            unit: (!row.unit.is_empty()).then_some(row.unit),
            retention_days: row.retention_days,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
            labels,
        })
    }
}

#[async_trait]
impl MetricStore for ClickHouseMetricStore {
    async fn find_by_name(&self, name: &str) -> EngineResult<Option<Metric>> {
        let rows: Vec<MetricRow> = self
            .client
            .query("SELECT id, name, kind, description, unit, retention_days, is_active, created_at, updated_at \
                    FROM metrics.metrics WHERE name = ? ORDER BY updated_at DESC LIMIT 1")
            .bind(name)
            .fetch_all()
            .await
            .map_err(EngineError::from)?;
        match rows.into_iter().next() {
            None => Ok(None),
            Some(row) => {
                let labels = self.labels_of(row.id).await?;
                Ok(Some(Self::row_to_metric(row, labels)?))
            }
        }
    }

    async fn find_by_id(&self, id: Uuid) -> EngineResult<Option<Metric>> {
        let rows: Vec<MetricRow> = self
            .client
            .query("SELECT id, name, kind, description, unit, retention_days, is_active, created_at, updated_at \
                    FROM metrics.metrics WHERE id = ? ORDER BY updated_at DESC LIMIT 1")
            .bind(id)
            .fetch_all()
            .await
            .map_err(EngineError::from)?;
        match rows.into_iter().next() {
            None => Ok(None),
            Some(row) => {
                let labels = self.labels_of(row.id).await?;
                Ok(Some(Self::row_to_metric(row, labels)?))
            }
        }
    }

    async fn list(&self, filter: &MetricFilter) -> EngineResult<Vec<Metric>> {
        let mut where_parts = vec!["1 = 1".to_string()];
        if filter.active_only {
            where_parts.push("is_active = true".to_string());
        }
        if let Some(kind) = filter.kind {
            where_parts.push(format!("kind = '{}'", kind.as_str()));
        }
        if let Some(prefix) = &filter.name_prefix {
            where_parts.push(format!("startsWith(name, '{}')", prefix.replace('\'', "\\'")));
        }
        let sql = format!(
            "SELECT id, name, kind, description, unit, retention_days, is_active, created_at, updated_at \
             FROM metrics.metrics WHERE {} ORDER BY name ASC LIMIT 10000",
            where_parts.join(" AND ")
        );
        let rows: Vec<MetricRow> = self.client.query(&sql).fetch_all().await.map_err(EngineError::from)?;
        let mut metrics = Vec::with_capacity(rows.len());
        for row in rows {
            let labels = self.labels_of(row.id).await?;
            metrics.push(Self::row_to_metric(row, labels)?);
        }
        Ok(metrics)
    }

    async fn insert(&self, metric: &Metric) -> EngineResult<()> {
        self.save(metric).await?;
        if !metric.labels.is_empty() {
            let mut insert = self
                .client
                .insert("metrics.metric_labels")
                .map_err(EngineError::from)?;
            for key in &metric.labels {
                #[derive(serde::Serialize, clickhouse::Row)]
                struct LabelRow {
                    #[serde(with = "clickhouse::serde::uuid")]
                    metric_id: Uuid,
                    label_key: String,
                }
                insert
                    .write(&LabelRow {
                        metric_id: metric.id,
                        label_key: key.clone(),
                    })
                    .await
                    .map_err(EngineError::from)?;
            }
            insert.end().await.map_err(EngineError::from)?;
        }
        Ok(())
    }

    async fn save(&self, metric: &Metric) -> EngineResult<()> {
        #[derive(serde::Serialize, clickhouse::Row)]
        struct Row {
            #[serde(with = "clickhouse::serde::uuid")]
            id: Uuid,
            name: String,
            kind: String,
            description: String,
            unit: String,
            retention_days: u32,
            is_active: bool,
            #[serde(with = "clickhouse::serde::time::datetime")]
            created_at: DateTime<Utc>,
            #[serde(with = "clickhouse::serde::time::datetime")]
            updated_at: DateTime<Utc>,
        }
        let mut insert = self.client.insert("metrics.metrics").map_err(EngineError::from)?;
        insert
            .write(&Row {
                id: metric.id,
                name: metric.name.clone(),
                kind: metric.kind.as_str().to_string(),
                description: metric.description.clone().unwrap_or_default(),
                unit: metric.unit.clone().unwrap_or_default(),
                retention_days: metric.retention_days,
                is_active: metric.is_active,
                created_at: metric.created_at,
                updated_at: metric.updated_at,
            })
            .await
            .map_err(EngineError::from)?;
        insert.end().await.map_err(EngineError::from)?;
        Ok(())
    }
}

/// Definitions, label schema, and the process-wide lookup cache. Every
/// mutation writes through to the store first and only then touches the
/// cache, per invariant 5 (the cache must never answer with data the store
/// doesn't also have).
pub struct MetricRegistry {
    store: Arc<dyn MetricStore>,
    clock: Arc<dyn Clock>,
    by_name: DashMap<String, Metric>,
    by_id: DashMap<Uuid, String>,
}

impl MetricRegistry {
    pub fn new(store: Arc<dyn MetricStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            by_name: DashMap::new(),
            by_id: DashMap::new(),
        }
    }

    /// Load every metric into the cache. Intended to run once at startup.
    pub async fn preload(&self) -> EngineResult<usize> {
        let metrics = self.store.list(&MetricFilter::default()).await?;
        let count = metrics.len();
        for metric in metrics {
            self.by_id.insert(metric.id, metric.name.clone());
            self.by_name.insert(metric.name.clone(), metric);
        }
        Ok(count)
    }

    pub async fn register(&self, definition: MetricDefinition) -> EngineResult<Metric> {
        validate_metric_name(&definition.name).map_err(EngineError::BadInput)?;
        validate_label_schema(&definition.labels).map_err(EngineError::BadInput)?;
        validate_retention_days(definition.retention_days).map_err(EngineError::BadInput)?;

        if self.store.find_by_name(&definition.name).await?.is_some() {
            return Err(EngineError::Conflict(format!(
                "metric '{}' already exists",
                definition.name
            )));
        }

        let now = self.clock.now();
        let metric = Metric {
            id: Uuid::new_v4(),
            name: definition.name,
            kind: definition.kind,
            description: definition.description,
            unit: definition.unit,
            retention_days: definition.retention_days,
            is_active: true,
            created_at: now,
            updated_at: now,
            labels: definition.labels,
        };
        self.store.insert(&metric).await?;
        self.by_id.insert(metric.id, metric.name.clone());
        self.by_name.insert(metric.name.clone(), metric.clone());
        Ok(metric)
    }

    /// Hot-path lookup used on every ingested sample: cache first, store on miss.
    pub async fn get_by_name(&self, name: &str) -> EngineResult<Option<Metric>> {
        if let Some(hit) = self.by_name.get(name) {
            return Ok(Some(hit.clone()));
        }
        let found = self.store.find_by_name(name).await?;
        if let Some(metric) = &found {
            self.by_id.insert(metric.id, metric.name.clone());
            self.by_name.insert(metric.name.clone(), metric.clone());
        }
        Ok(found)
    }

    pub async fn get_by_id(&self, id: Uuid) -> EngineResult<Option<Metric>> {
        if let Some(name) = self.by_id.get(&id) {
            if let Some(hit) = self.by_name.get(name.as_str()) {
                return Ok(Some(hit.clone()));
            }
        }
        let found = self.store.find_by_id(id).await?;
        if let Some(metric) = &found {
            self.by_id.insert(metric.id, metric.name.clone());
            self.by_name.insert(metric.name.clone(), metric.clone());
        }
        Ok(found)
    }

    pub async fn list(&self, filter: MetricFilter) -> EngineResult<Vec<Metric>> {
        self.store.list(&filter).await
    }

    pub async fn update(&self, id: Uuid, update: MetricUpdate) -> EngineResult<Metric> {
        let mut metric = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("metric {id} not found")))?;

        if let Some(days) = update.retention_days {
            validate_retention_days(days).map_err(EngineError::BadInput)?;
            metric.retention_days = days;
        }
        if let Some(active) = update.active {
            metric.is_active = active;
        }
        metric.updated_at = self.clock.now();

        self.store.save(&metric).await?;
        self.by_name.insert(metric.name.clone(), metric.clone());
        Ok(metric)
    }

    /// Soft-delete clears `is_active` and removes the cache entry so a
    /// subsequent lookup cannot revive it from a stale cache hit.
    pub async fn soft_delete(&self, id: Uuid) -> EngineResult<()> {
        let mut metric = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("metric {id} not found")))?;
        metric.is_active = false;
        metric.updated_at = self.clock.now();
        self.store.save(&metric).await?;
        self.by_name.remove(&metric.name);
        self.by_id.remove(&id);
        Ok(())
    }

    /// Auto-registration used by ingestion when a sample names an unknown
    /// metric. Registers with an empty label schema and the given (or
    /// inferred GAUGE) kind, reusing the same validation as `register`.
    pub async fn get_or_create(&self, name: &str, kind: MetricKind) -> EngineResult<Metric> {
        if let Some(existing) = self.get_by_name(name).await? {
            return Ok(existing);
        }
        match self
            .register(MetricDefinition {
                name: name.to_string(),
                kind,
                description: None,
                unit: None,
                retention_days: crate::models::metric::RETENTION_DAYS_DEFAULT,
                labels: BTreeSet::new(),
            })
            .await
        {
            Ok(metric) => Ok(metric),
            // Lost a race with a concurrent auto-registration of the same name.
            Err(EngineError::Conflict(_)) => self
                .get_by_name(name)
                .await?
                .ok_or_else(|| EngineError::Fatal(format!("metric '{name}' vanished after conflict"))),
            Err(other) => Err(other),
        }
    }

    pub async fn labels_of(&self, id: Uuid) -> EngineResult<BTreeSet<String>> {
        Ok(self
            .get_by_id(id)
            .await?
            .map(|m| m.labels)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryMetricStore {
        by_id: Mutex<std::collections::HashMap<Uuid, Metric>>,
    }

    #[async_trait]
    impl MetricStore for InMemoryMetricStore {
        async fn find_by_name(&self, name: &str) -> EngineResult<Option<Metric>> {
            Ok(self.by_id.lock().unwrap().values().find(|m| m.name == name).cloned())
        }
        async fn find_by_id(&self, id: Uuid) -> EngineResult<Option<Metric>> {
            Ok(self.by_id.lock().unwrap().get(&id).cloned())
        }
        async fn list(&self, _filter: &MetricFilter) -> EngineResult<Vec<Metric>> {
            Ok(self.by_id.lock().unwrap().values().cloned().collect())
        }
        async fn insert(&self, metric: &Metric) -> EngineResult<()> {
            self.by_id.lock().unwrap().insert(metric.id, metric.clone());
            Ok(())
        }
        async fn save(&self, metric: &Metric) -> EngineResult<()> {
            self.by_id.lock().unwrap().insert(metric.id, metric.clone());
            Ok(())
        }
    }

    fn registry() -> MetricRegistry {
        let clock = Arc::new(crate::clock::FixedClock::new(Utc::now()));
        MetricRegistry::new(Arc::new(InMemoryMetricStore::default()), clock)
    }

    #[tokio::test]
    async fn register_then_get_by_name_hits_cache() {
        let reg = registry();
        let metric = reg
            .register(MetricDefinition {
                name: "cpu.load".to_string(),
                kind: MetricKind::Gauge,
                description: None,
                unit: None,
                retention_days: 30,
                labels: BTreeSet::new(),
            })
            .await
            .unwrap();
        let fetched = reg.get_by_name("cpu.load").await.unwrap().unwrap();
        assert_eq!(fetched.id, metric.id);
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let reg = registry();
        let def = MetricDefinition {
            name: "dup".to_string(),
            kind: MetricKind::Counter,
            description: None,
            unit: None,
            retention_days: 30,
            labels: BTreeSet::new(),
        };
        reg.register(def.clone()).await.unwrap();
        let err = reg.register(def).await.unwrap_err();
        assert_eq!(err.kind(), "CONFLICT");
    }

    #[tokio::test]
    async fn soft_delete_removes_cache_entry() {
        let reg = registry();
        let metric = reg
            .register(MetricDefinition {
                name: "to.delete".to_string(),
                kind: MetricKind::Gauge,
                description: None,
                unit: None,
                retention_days: 30,
                labels: BTreeSet::new(),
            })
            .await
            .unwrap();
        reg.soft_delete(metric.id).await.unwrap();
        let fetched = reg.get_by_id(metric.id).await.unwrap().unwrap();
        assert!(!fetched.is_active);
    }

    #[tokio::test]
    async fn get_or_create_registers_unknown_metric() {
        let reg = registry();
        let metric = reg.get_or_create("auto.metric", MetricKind::Gauge).await.unwrap();
        assert_eq!(metric.name, "auto.metric");
        assert!(metric.labels.is_empty());
        let again = reg.get_or_create("auto.metric", MetricKind::Gauge).await.unwrap();
        assert_eq!(again.id, metric.id);
    }
}
