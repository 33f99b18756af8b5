//! `draftmill-pipeline`
//!
//! **Responsibility:** drive a generation job to completion one unit of work
//! per invocation, surviving crashes and timeouts through persisted state.
//!
//! - `record`/`store`: the Job Record and its persistence seam.
//! - `plan`/`resume`/`memo`: what to run next, and what can be skipped.
//! - `retry`/`executor`/`prompt`: one escalating provider call per unit.
//! - `heartbeat`: liveness while an invocation runs.
//! - `merge`/`qc`: deterministic assembly and the quality gate.
//! - `orchestrator`: the `continue` trigger and job lifecycle.

pub mod config;
pub mod executor;
pub mod fixtures;
pub mod heartbeat;
pub mod memo;
pub mod merge;
pub mod orchestrator;
pub mod plan;
pub mod prompt;
pub mod qc;
pub mod record;
pub mod resume;
pub mod retry;
pub mod store;


pub use config::PipelineConfig;
pub use executor::{ChunkExecutor, UnitFailure, UnitSuccess, WorkUnit};
pub use heartbeat::{HeartbeatContext, HeartbeatHandle, HeartbeatPublisher};
pub use memo::{Memoized, SubstepHashes, idempotency_hash, run_if_needed};
pub use merge::{Act, Artifact, ArtifactBuilder};
pub use orchestrator::{ContinueOutcome, Orchestrator, OrchestratorError, ResetMode};
pub use plan::{ChunkSpec, OutlineShape, Substep};
pub use qc::{QcConfig, QcValidator, QcVerdict, Quality};
pub use record::{
    Beat, ChunkState, GenerationBrief, JobRecord, JobStatus, JobStatusView, PartStatus, Stage,
    StagePart,
};
pub use resume::{ChunkCursor, ResumePoint, detect_resume_point};
pub use retry::{AttemptPlan, EscalatingRetryPolicy};
pub use store::{InMemoryJobStore, JobPatch, JobStore, StoreError};
