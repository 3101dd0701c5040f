use axum::extract::State;
use axum::Json;

use crate::error::EngineError;
use crate::models::sample::{IngestBatch, IngestResult};
use crate::AppState;

pub async fn ingest_samples(
    State(state): State<AppState>,
    Json(batch): Json<IngestBatch>,
) -> Result<Json<IngestResult>, EngineError> {
    let result = state.ingestion.ingest(batch).await?;
    Ok(Json(result))
}
