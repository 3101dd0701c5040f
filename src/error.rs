use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Error kinds per the engine's error taxonomy. Every error carries a kind tag
/// and a human message; `BadInput` messages name the offending field.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::BadInput(_) => "BAD_INPUT",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::Conflict(_) => "CONFLICT",
            EngineError::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            EngineError::Transient(_) => "TRANSIENT",
            EngineError::Fatal(_) => "FATAL",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            EngineError::BadInput(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            EngineError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Storage-layer errors always surface as Transient unless the caller can prove
/// otherwise (e.g. a row genuinely missing, which is NotFound).
impl From<clickhouse::error::Error> for EngineError {
    fn from(e: clickhouse::error::Error) -> Self {
        EngineError::Transient(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
