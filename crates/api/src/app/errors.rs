use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use draftmill_core::DomainError;
use draftmill_pipeline::{OrchestratorError, StoreError};

pub fn orchestrator_error_to_response(err: OrchestratorError) -> axum::response::Response {
    match err {
        OrchestratorError::NotFound(job_id) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("job {job_id} not found"),
        ),
        OrchestratorError::NotResettable { .. } => {
            json_error(StatusCode::CONFLICT, "not_resettable", err.to_string())
        }
        OrchestratorError::Domain(DomainError::Validation(msg)) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        OrchestratorError::Domain(e) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", e.to_string())
        }
        OrchestratorError::Store(StoreError::NotFound(job_id)) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("job {job_id} not found"),
        ),
        OrchestratorError::Store(e) => {
            tracing::error!(error = %e, "record store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_job_id(raw: &str) -> Result<draftmill_core::JobId, axum::response::Response> {
    raw.parse()
        .map_err(|e: DomainError| json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}
