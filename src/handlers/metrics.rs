use axum::extract::{Path, Query as AxumQuery, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::metric::{Metric, MetricDefinition, MetricFilter, MetricUpdate};
use crate::AppState;

pub async fn register_metric(
    State(state): State<AppState>,
    Json(definition): Json<MetricDefinition>,
) -> Result<(StatusCode, Json<Metric>), EngineError> {
    let metric = state.registry.register(definition).await?;
    Ok((StatusCode::CREATED, Json(metric)))
}

pub async fn list_metrics(
    State(state): State<AppState>,
    AxumQuery(filter): AxumQuery<MetricFilter>,
) -> Result<Json<Vec<Metric>>, EngineError> {
    let metrics = state.registry.list(filter).await?;
    Ok(Json(metrics))
}

pub async fn get_metric(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Metric>, EngineError> {
    let metric = state
        .registry
        .get_by_name(&name)
        .await?
        .ok_or_else(|| EngineError::NotFound(format!("metric '{name}' not found")))?;
    Ok(Json(metric))
}

pub async fn update_metric(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<MetricUpdate>,
) -> Result<Json<Metric>, EngineError> {
    let metric = state.registry.update(id, update).await?;
    Ok(Json(metric))
}

pub async fn delete_metric(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, EngineError> {
    state.registry.soft_delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
