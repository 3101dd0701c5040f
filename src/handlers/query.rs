use axum::extract::{Query as AxumQuery, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::error::EngineError;
use crate::export::{ExportFormat, ExportFormatter};
use crate::models::query::{QueryRequest, QueryResponse};
use crate::AppState;

pub async fn execute_query(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, EngineError> {
    let response = state.query_planner.execute(request).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    #[serde(default)]
    pub format: Option<String>,
}

/// Same query, rendered in whichever wire format the `format` query param
/// names (`csv`, `line-protocol`); defaults to JSON.
pub async fn export_query(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<ExportParams>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, EngineError> {
    let response = state.query_planner.execute(request).await?;
    let format = match params.format.as_deref() {
        Some("csv") => ExportFormat::Csv,
        Some("line-protocol") | Some("line_protocol") => ExportFormat::LineProtocol,
        _ => ExportFormat::Json,
    };
    let content_type = match format {
        ExportFormat::Json => "application/json",
        ExportFormat::Csv => "text/csv",
        ExportFormat::LineProtocol => "text/plain; version=0.0.4",
    };
    let body = ExportFormatter::render(&response, format).map_err(EngineError::Fatal)?;
    Ok(([(CONTENT_TYPE, content_type)], body).into_response())
}
