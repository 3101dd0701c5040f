pub mod archival;
pub mod cardinality;
pub mod clock;
pub mod config;
pub mod error;
pub mod export;
pub mod handlers;
pub mod ingest;
pub mod migrations;
pub mod models;
pub mod object_store;
pub mod query_planner;
pub mod rate_engine;
pub mod registry;
pub mod storage;

use std::sync::Arc;

use archival::ArchivalEngine;
use cardinality::CardinalityGuard;
use ingest::IngestionPipeline;
use query_planner::QueryPlanner;
use registry::MetricRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<MetricRegistry>,
    pub ingestion: Arc<IngestionPipeline>,
    pub query_planner: Arc<QueryPlanner>,
    pub cardinality: Arc<CardinalityGuard>,
    pub archival: Arc<ArchivalEngine>,
}
