use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::info;

use draftmill_pipeline::GenerationBrief;

use crate::app::dto::{
    ArtifactResponse, ContinueResponse, CreateJobRequest, CreateJobResponse, ListJobsQuery,
    ResetRequest,
};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs).post(create_job))
        .route("/:id", get(get_job))
        .route("/:id/continue", post(continue_job))
        .route("/:id/artifact", get(get_artifact))
        .route("/:id/reset", post(reset_job))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<CreateJobRequest>,
) -> axum::response::Response {
    let brief = GenerationBrief::from(body);
    let job_id = match services.create_job(brief).await {
        Ok(id) => id,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };

    let status = match services.status(job_id).await {
        Ok(view) => view.status,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };

    (StatusCode::CREATED, Json(CreateJobResponse { job_id, status })).into_response()
}

/// The trigger. Safe to call redundantly; each call does at most one unit of work.
pub async fn continue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let outcome = match services.continue_job(job_id).await {
        Ok(outcome) => outcome,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };
    info!(job_id = %job_id, more_remaining = outcome.more_remaining(), "continue handled");

    match services.status(job_id).await {
        Ok(job) => Json(ContinueResponse { outcome, job }).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.status(job_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn get_artifact(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let record = match services.job(job_id).await {
        Ok(record) => record,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };

    match record.artifact {
        Some(artifact) => Json(ArtifactResponse {
            job_id,
            status: record.status,
            qc: record.qc,
            artifact,
        })
        .into_response(),
        None => errors::json_error(
            StatusCode::CONFLICT,
            "not_ready",
            format!("job {job_id} has no artifact yet (status {})", record.status),
        ),
    }
}

pub async fn reset_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<ResetRequest>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.reset_job(job_id, body.mode).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListJobsQuery>,
) -> axum::response::Response {
    let result = if query.stale {
        services.stale_jobs(query.limit()).await
    } else {
        services.list_jobs(query.limit()).await
    };

    match result {
        Ok(jobs) => Json(serde_json::json!({ "jobs": jobs })).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
