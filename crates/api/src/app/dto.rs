use serde::{Deserialize, Serialize};

use draftmill_core::JobId;
use draftmill_pipeline::{
    Artifact, ContinueOutcome, GenerationBrief, JobStatus, JobStatusView, QcVerdict, ResetMode,
};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub premise: String,
    pub genre: String,
    pub tone: String,
    pub audience: Option<String>,
}

impl From<CreateJobRequest> for GenerationBrief {
    fn from(req: CreateJobRequest) -> Self {
        let brief = GenerationBrief::new(req.premise, req.genre, req.tone);
        match req.audience {
            Some(audience) => brief.with_audience(audience),
            None => brief,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub mode: ResetMode,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
    /// Only generating jobs with a quiet heartbeat.
    #[serde(default)]
    pub stale: bool,
}

impl ListJobsQuery {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 500;

    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct ContinueResponse {
    pub outcome: ContinueOutcome,
    pub job: JobStatusView,
}

#[derive(Debug, Serialize)]
pub struct ArtifactResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub qc: Option<QcVerdict>,
    pub artifact: Artifact,
}
