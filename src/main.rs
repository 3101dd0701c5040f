use axum::routing::{get, post, put};
use axum::Router;
use clickhouse::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use metric_engine::archival::{ArchivalEngine, ClickHouseArchiveMetadataStore};
use metric_engine::cardinality::CardinalityGuard;
use metric_engine::clock::{Clock, SystemClock};
use metric_engine::config::MetricEngineConfig;
use metric_engine::handlers;
use metric_engine::ingest::IngestionPipeline;
use metric_engine::object_store::{InMemoryObjectStore, ObjectStore, S3ObjectStore};
use metric_engine::query_planner::QueryPlanner;
use metric_engine::rate_engine::RateEngine;
use metric_engine::registry::{ClickHouseMetricStore, MetricRegistry};
use metric_engine::storage::{ClickHouseStorage, StorageGateway};
use metric_engine::{migrations, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("metric_engine=debug,tower_http=debug")),
        )
        .init();

    let clickhouse_url = std::env::var("CLICKHOUSE_URL").unwrap_or_else(|_| "http://localhost:8123".to_string());
    let clickhouse_user = std::env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".to_string());
    let clickhouse_password = std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default();

    let config_path = std::env::var("METRIC_ENGINE_CONFIG").unwrap_or_else(|_| "./metric_engine.toml".to_string());
    let config = MetricEngineConfig::load(&config_path)?;

    migrations::run(&clickhouse_url, &clickhouse_user, &clickhouse_password, &config).await?;
    tracing::info!("schema migrations applied");

    let ch = Client::default()
        .with_url(&clickhouse_url)
        .with_database("metrics")
        .with_user(&clickhouse_user)
        .with_password(&clickhouse_password);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let metric_store = Arc::new(ClickHouseMetricStore::new(ch.clone()));
    let registry = Arc::new(MetricRegistry::new(metric_store, clock.clone()));
    let preloaded = registry.preload().await?;
    tracing::info!(metrics = preloaded, "metric registry preloaded");

    let storage: Arc<dyn StorageGateway> = Arc::new(ClickHouseStorage::new(ch.clone()));

    let cardinality = Arc::new(CardinalityGuard::new(
        storage.clone(),
        clock.clone(),
        config.cardinality.clone(),
    ));

    let ingestion = IngestionPipeline::new(
        registry.clone(),
        cardinality.clone(),
        storage.clone(),
        clock.clone(),
        config.ingestion.clone(),
    );

    let rate_engine = Arc::new(RateEngine::new(storage.clone(), registry.clone()));

    let object_store: Arc<dyn ObjectStore> = if config.object_store.endpoint.is_some() {
        Arc::new(S3ObjectStore::from_config(&config.object_store).await)
    } else {
        match std::env::var("METRIC_ENGINE_OBJECT_STORE").as_deref() {
            Ok("memory") => Arc::new(InMemoryObjectStore::with_bucket(&config.cold_tier.bucket)),
            _ => Arc::new(S3ObjectStore::from_config(&config.object_store).await),
        }
    };

    let archive_metadata = Arc::new(ClickHouseArchiveMetadataStore::new(ch.clone()));
    let archival = Arc::new(ArchivalEngine::new(
        storage.clone(),
        object_store,
        archive_metadata,
        registry.clone(),
        clock.clone(),
        config.cold_tier.clone(),
    ));

    let query_planner = Arc::new(QueryPlanner::new(
        registry.clone(),
        storage.clone(),
        rate_engine,
        archival.clone(),
        clock.clone(),
        config.hot_tier.clone(),
        config.query.clone(),
    ));

    spawn_archival_scheduler(archival.clone());

    let state = AppState {
        registry,
        ingestion,
        query_planner,
        cardinality,
        archival,
    };

    let app = Router::new()
        .route("/api/v1/ingest", post(handlers::ingest::ingest_samples))
        .route("/api/v1/query", post(handlers::query::execute_query))
        .route("/api/v1/query/export", post(handlers::query::export_query))
        .route(
            "/api/v1/metrics",
            get(handlers::metrics::list_metrics).post(handlers::metrics::register_metric),
        )
        .route("/api/v1/metrics/{name}", get(handlers::metrics::get_metric))
        .route(
            "/api/v1/metrics/id/{id}",
            put(handlers::metrics::update_metric).delete(handlers::metrics::delete_metric),
        )
        .route("/healthz", get(handlers::health::healthz))
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    tracing::info!("metric-engine listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// No cron crate in the dependency stack: this computes the delay until the
/// next occurrence of 02:00 UTC itself and re-arms after every run, matching
/// the cold-tier config's `cron` field (`0 0 2 * * ?`) without a scheduler.
fn spawn_archival_scheduler(archival: Arc<ArchivalEngine>) {
    tokio::spawn(async move {
        loop {
            let delay = duration_until_next_2am_utc();
            tracing::info!(delay_secs = delay.as_secs(), "archival job scheduled");
            tokio::time::sleep(delay).await;

            let stats = archival.run_archival_job().await;
            if stats.errors.is_empty() {
                tracing::info!(
                    segments_written = stats.segments_written,
                    rows_archived = stats.rows_archived,
                    rows_deleted = stats.rows_deleted,
                    "archival job completed"
                );
            } else {
                tracing::warn!(errors = ?stats.errors, "archival job completed with errors");
            }
        }
    });
}

fn duration_until_next_2am_utc() -> std::time::Duration {
    let now = chrono::Utc::now();
    let mut next = now.date_naive().and_hms_opt(2, 0, 0).unwrap().and_utc();
    if next <= now {
        next += chrono::Duration::days(1);
    }
    (next - now).to_std().unwrap_or(std::time::Duration::from_secs(3600))
}
