//! The orchestrator: one unit of work per invocation.
//!
//! `continue_job` loads the record, asks the resume detector where to pick
//! up, performs exactly one unit (a single-call sub-step or one chunk),
//! persists the outcome in one patch and returns. Retries happen on later
//! invocations; nothing here sleeps or loops on a provider.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, instrument, warn};

use draftmill_core::{DomainError, InvocationId, JobId};
use draftmill_providers::{CircuitBreaker, ErrorClass, ProviderPool};

use crate::config::PipelineConfig;
use crate::executor::{ChunkExecutor, UnitFailure, WorkUnit};
use crate::heartbeat::{HeartbeatContext, HeartbeatHandle, HeartbeatPublisher};
use crate::memo::{Memoized, SubstepHashes, run_if_needed};
use crate::merge::{ArtifactBuilder, placeholder_beat, template_scaffold};
use crate::plan::{ChunkSpec, OutlineShape, Substep};
use crate::prompt::PromptContext;
use crate::qc::{QcValidator, QcVerdict};
use crate::record::{
    FailureNote, GenerationBrief, JobRecord, JobStatus, JobStatusView, PartStatus, Stage, StagePart,
};
use crate::resume::{ResumePoint, detect_resume_point, meets_minimum};
use crate::store::{JobPatch, JobStore, StoreError};

pub const MAX_RETRIES: &str = "MAX_RETRIES";
pub const QC_REJECTED: &str = "QC_REJECTED";
pub const PROVIDERS_UNHEALTHY: &str = "PROVIDERS_UNHEALTHY";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id} cannot be reset: {reason}")]
    NotResettable { job_id: JobId, reason: String },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What one `continue_job` invocation did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ContinueOutcome {
    /// One unit committed (or found already committed); more work remains.
    /// A controlled exit, not a failure.
    Advanced {
        completed: String,
        next: String,
        progress: u8,
        cached: bool,
    },
    /// Merge and QC ran; the artifact is attached.
    Completed { verdict: QcVerdict },
    /// A retryable failure was recorded. Call `continue` again.
    Stalled { error_code: String, retry_count: u32 },
    /// Terminal failure; needs a reset.
    Failed { error_code: String },
    /// The job was already completed or failed; nothing was touched.
    AlreadyTerminal { status: JobStatus },
}

impl ContinueOutcome {
    pub fn more_remaining(&self) -> bool {
        matches!(
            self,
            ContinueOutcome::Advanced { .. } | ContinueOutcome::Stalled { .. }
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetMode {
    /// Clear the failed unit's retry budget and mark the job stalled.
    RetryCurrent,
    /// Discard every part, QC and artifact; progress goes back to 0.
    Hard,
}

pub struct Orchestrator<S: JobStore> {
    store: Arc<S>,
    executor: ChunkExecutor,
    qc: QcValidator,
    heartbeat: HeartbeatPublisher,
    config: PipelineConfig,
}

impl<S: JobStore> Orchestrator<S> {
    pub fn new(store: Arc<S>, pool: ProviderPool, config: PipelineConfig) -> Result<Self, OrchestratorError> {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        Self::with_breaker(store, pool, breaker, config)
    }

    /// Share one circuit breaker across orchestrators in the same process.
    pub fn with_breaker(
        store: Arc<S>,
        pool: ProviderPool,
        breaker: Arc<CircuitBreaker>,
        config: PipelineConfig,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        Ok(Self {
            executor: ChunkExecutor::new(pool, breaker, config.retry.clone(), config.shape),
            qc: QcValidator::new(config.shape, config.qc.clone()),
            heartbeat: HeartbeatPublisher::new(config.heartbeat_interval),
            store,
            config,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        self.executor.breaker()
    }

    pub async fn create_job(&self, brief: GenerationBrief) -> Result<JobId, OrchestratorError> {
        brief.validate()?;
        let record = JobRecord::new(brief);
        let job_id = record.id;
        self.store.insert(record).await?;
        info!(job_id = %job_id, "job created");
        Ok(job_id)
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatusView, OrchestratorError> {
        Ok(self.load(job_id).await?.status_view())
    }

    pub async fn job(&self, job_id: JobId) -> Result<JobRecord, OrchestratorError> {
        self.load(job_id).await
    }

    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<JobStatusView>, OrchestratorError> {
        let records = self.store.list(limit).await?;
        Ok(records.iter().map(JobRecord::status_view).collect())
    }

    /// Generating jobs among the `limit` most recent whose heartbeat went
    /// quiet for longer than the stall threshold. A supervisor sweep re-triggers these.
    pub async fn stale_jobs(&self, limit: usize) -> Result<Vec<JobStatusView>, OrchestratorError> {
        let threshold = chrono::Duration::from_std(self.config.stall_threshold)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let now = Utc::now();
        let records = self.store.list(limit).await?;
        Ok(records
            .iter()
            .filter(|r| r.is_heartbeat_stale(now, threshold))
            .map(JobRecord::status_view)
            .collect())
    }

    /// Drive the job forward by at most one unit of provider work.
    #[instrument(skip(self, job_id), fields(job_id = %job_id, invocation_id = %InvocationId::new()))]
    pub async fn continue_job(&self, job_id: JobId) -> Result<ContinueOutcome, OrchestratorError> {
        let record = self.load(job_id).await?;
        if record.status.is_terminal() {
            info!(status = %record.status, "job already terminal, nothing to do");
            return Ok(ContinueOutcome::AlreadyTerminal {
                status: record.status,
            });
        }

        let shape = self.config.shape;
        let hashes = SubstepHashes::compute(&record.brief, &shape, &record.parts);
        let point = detect_resume_point(&shape, &record.parts, &hashes);
        let substage = point.label();
        let progress = compute_progress(&shape, &record.parts, &hashes).max(record.progress);

        self.store
            .update(
                job_id,
                JobPatch::new()
                    .status(JobStatus::Generating)
                    .stage(point.stage())
                    .substage(substage.clone())
                    .attempts(record.attempts + 1),
            )
            .await?;
        info!(substage = %substage, attempt = record.attempts + 1, "invocation started");

        let heartbeat = self.heartbeat.start(
            self.store.clone(),
            job_id,
            HeartbeatContext {
                substage,
                progress,
            },
        );
        let result = self.run_unit(job_id, point, &hashes, &heartbeat).await;
        heartbeat.stop().await;

        match &result {
            Ok(outcome) => info!(?outcome, "invocation finished"),
            Err(e) => warn!(error = %e, "invocation aborted"),
        }
        result
    }

    /// Manual intervention for jobs that will not progress on their own.
    pub async fn reset_job(&self, job_id: JobId, mode: ResetMode) -> Result<JobStatusView, OrchestratorError> {
        let record = self.load(job_id).await?;

        let patch = match mode {
            ResetMode::Hard => JobPatch::new()
                .reset_parts()
                .status(JobStatus::Queued)
                .stage(Stage::None)
                .substage("")
                .progress(0)
                .clear_error()
                .qc(None)
                .artifact(None),
            ResetMode::RetryCurrent => {
                if record.status == JobStatus::Completed {
                    return Err(OrchestratorError::NotResettable {
                        job_id,
                        reason: "job is completed; use a hard reset to regenerate".into(),
                    });
                }
                let retried: Vec<StagePart> = record
                    .parts
                    .values()
                    .filter(|p| p.status == PartStatus::Failed || p.retry_count > 0)
                    .cloned()
                    .map(|mut part| {
                        let any_done = part.chunks.as_ref().is_some_and(|c| !c.chunks_done.is_empty());
                        part.status = if any_done {
                            PartStatus::Partial
                        } else {
                            PartStatus::Pending
                        };
                        part.retry_count = 0;
                        part.last_failure = None;
                        part.updated_at = Utc::now();
                        part
                    })
                    .collect();

                if retried.is_empty() && record.status == JobStatus::Failed {
                    return Err(OrchestratorError::NotResettable {
                        job_id,
                        reason: format!(
                            "no failed unit to retry (error {}); use a hard reset",
                            record.error_code.as_deref().unwrap_or("unknown")
                        ),
                    });
                }

                let mut patch = JobPatch::new().status(JobStatus::Stalled).clear_error();
                for part in retried {
                    patch = patch.upsert_part(part);
                }
                patch
            }
        };

        self.store.update(job_id, patch).await?;
        info!(job_id = %job_id, ?mode, "job reset");
        self.status(job_id).await
    }

    async fn load(&self, job_id: JobId) -> Result<JobRecord, OrchestratorError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::NotFound(job_id))
    }

    async fn run_unit(
        &self,
        job_id: JobId,
        point: ResumePoint,
        hashes: &SubstepHashes,
        heartbeat: &HeartbeatHandle,
    ) -> Result<ContinueOutcome, OrchestratorError> {
        let (substep, cursor) = match point {
            ResumePoint::Merge => {
                let record = self.load(job_id).await?;
                return self.merge_and_finish(&record).await;
            }
            ResumePoint::Run { substep, chunk } => (substep, chunk),
        };

        let shape = self.config.shape;
        let hash = hashes.get(substep);

        // Re-read right before spending a call: a racing invocation may have
        // committed this unit in the meantime.
        let mut fresh = self.load(job_id).await?;
        let untrusted = fresh
            .parts
            .get(substep.name())
            .is_some_and(|p| p.hash == hash && p.is_done() && !meets_minimum(substep, p, &shape));
        if untrusted {
            // A done part missing required content is regenerated from scratch.
            warn!(substep = %substep, "stored part is below its structural minimum, discarding");
            self.store
                .update(job_id, JobPatch::new().discard_part(substep.name()))
                .await?;
            fresh = self.load(job_id).await?;
        }
        let stored = fresh.parts.get(substep.name()).filter(|p| p.hash == hash);
        let mut part = stored.cloned().unwrap_or_else(|| {
            if substep.is_chunked() {
                StagePart::chunked(substep.name(), hash, shape.chunks_total())
            } else {
                StagePart::pending(substep.name(), hash)
            }
        });

        let label = cursor
            .as_ref()
            .map(|c| c.spec.label())
            .unwrap_or_else(|| substep.name().to_string());
        let context = PromptContext {
            brief: &fresh.brief,
            summary: done_data(&fresh.parts, Substep::Summary),
            scaffold: done_data(&fresh.parts, Substep::Scaffold),
        };
        let attempt = part.retry_count;
        let strict_format = part
            .last_failure
            .as_ref()
            .is_some_and(|f| f.class == ErrorClass::ParseValidation);

        match cursor {
            None if substep.is_chunked() => {
                // Every chunk is committed; only the part status lags behind.
                part.status = PartStatus::Done;
                self.commit(&fresh, Some(part), label, heartbeat).await
            }
            None => {
                let unit = WorkUnit {
                    job_id,
                    substep,
                    context,
                    chunk: None,
                    attempt,
                    strict_format,
                };
                let executor = &self.executor;
                let unit_ref = &unit;
                let memo = run_if_needed(stored, hash, move || async move {
                    executor.execute_step(unit_ref).await.map(|success| {
                        info!(
                            substep = %substep,
                            provider = %success.provider,
                            tier = %success.tier,
                            attempt,
                            "sub-step generated"
                        );
                        success.output
                    })
                })
                .await;

                match memo {
                    Ok(Memoized::Cached(_)) => self.commit(&fresh, None, label, heartbeat).await,
                    Ok(Memoized::Fresh(value)) => {
                        part.complete_with(value);
                        self.commit(&fresh, Some(part), label, heartbeat).await
                    }
                    Err(failure) => {
                        self.record_failure(&fresh, part, label, None, failure, heartbeat)
                            .await
                    }
                }
            }
            Some(cursor) => {
                let already_committed = stored.and_then(|p| p.chunks.as_ref()).is_some_and(|c| {
                    c.chunks_done.contains(&cursor.spec.index)
                        && cursor.spec.positions().all(|p| c.beats.contains_key(&p))
                });
                if already_committed {
                    return self.commit(&fresh, None, label, heartbeat).await;
                }

                let unit = WorkUnit {
                    job_id,
                    substep,
                    context,
                    chunk: Some((&cursor.spec, &cursor.accumulated)),
                    attempt,
                    strict_format,
                };
                match self.executor.execute_chunk(&unit).await {
                    Ok(success) => {
                        info!(
                            chunk = cursor.spec.index,
                            chunks_total = cursor.spec.total,
                            provider = %success.provider,
                            tier = %success.tier,
                            attempt,
                            "chunk generated"
                        );
                        part.complete_chunk(cursor.spec.index, success.output);
                        self.commit(&fresh, Some(part), label, heartbeat).await
                    }
                    Err(failure) => {
                        self.record_failure(
                            &fresh,
                            part,
                            label,
                            Some(&cursor.spec),
                            failure,
                            heartbeat,
                        )
                        .await
                    }
                }
            }
        }
    }

    /// Persist a completed unit (or acknowledge one a racing invocation
    /// already committed) and move the job's cursor forward. When nothing but
    /// merge remains, merge and QC run in this same invocation.
    async fn commit(
        &self,
        fresh: &JobRecord,
        part: Option<StagePart>,
        completed: String,
        heartbeat: &HeartbeatHandle,
    ) -> Result<ContinueOutcome, OrchestratorError> {
        let shape = self.config.shape;
        let cached = part.is_none();

        let mut after = fresh.clone();
        let mut patch = JobPatch::new();
        if let Some(part) = part {
            patch = patch.upsert_part(part);
        }
        patch.clone().apply_to(&mut after, Utc::now());

        let hashes = SubstepHashes::compute(&after.brief, &shape, &after.parts);
        let next = detect_resume_point(&shape, &after.parts, &hashes);
        let progress = compute_progress(&shape, &after.parts, &hashes).max(fresh.progress);

        patch = patch
            .status(JobStatus::Generating)
            .stage(next.stage())
            .substage(next.label())
            .progress(progress)
            .clear_error();
        self.store.update(fresh.id, patch).await?;
        heartbeat.update_context(next.label(), progress);

        if next == ResumePoint::Merge {
            let record = self.load(fresh.id).await?;
            return self.merge_and_finish(&record).await;
        }

        Ok(ContinueOutcome::Advanced {
            completed,
            next: next.label(),
            progress,
            cached,
        })
    }

    async fn record_failure(
        &self,
        fresh: &JobRecord,
        mut part: StagePart,
        label: String,
        chunk: Option<&ChunkSpec>,
        failure: UnitFailure,
        heartbeat: &HeartbeatHandle,
    ) -> Result<ContinueOutcome, OrchestratorError> {
        let job_id = fresh.id;
        let policy = self.executor.policy();

        let (error, class) = match failure {
            UnitFailure::NoHealthyProvider => {
                // No call was made, so no retry budget is spent.
                let detail = format!(
                    "{label}: every provider is currently unhealthy. Safe to continue once they recover."
                );
                self.store
                    .update(
                        job_id,
                        JobPatch::new()
                            .status(JobStatus::Stalled)
                            .error(PROVIDERS_UNHEALTHY, detail),
                    )
                    .await?;
                warn!(substage = %label, error_code = PROVIDERS_UNHEALTHY, "job stalled");
                return Ok(ContinueOutcome::Stalled {
                    error_code: PROVIDERS_UNHEALTHY.to_string(),
                    retry_count: part.retry_count,
                });
            }
            UnitFailure::Exhausted { attempts } => {
                return self.fail_exhausted(fresh, part, &label, attempts).await;
            }
            UnitFailure::Provider { error, class, .. } => (error, class),
        };

        let code = error.code();
        let note = FailureNote {
            code: code.to_string(),
            class,
            detail: error.to_string(),
            chunk: chunk.map(|spec| spec.index),
            at: Utc::now(),
        };

        if class == ErrorClass::FatalProvider {
            part.status = PartStatus::Failed;
            part.last_failure = Some(note);
            part.updated_at = Utc::now();
            let detail = format!(
                "{label}: {error}. This will not succeed without changing provider settings."
            );
            self.store
                .update(
                    job_id,
                    JobPatch::new()
                        .status(JobStatus::Failed)
                        .error(code, detail)
                        .upsert_part(part),
                )
                .await?;
            warn!(substage = %label, error_code = code, "job failed");
            return Ok(ContinueOutcome::Failed {
                error_code: code.to_string(),
            });
        }

        part.retry_count += 1;
        part.last_failure = Some(note);
        part.updated_at = Utc::now();

        if let Some(next) = policy.plan_for(part.retry_count) {
            let detail = format!(
                "{label}: attempt {} of {} failed ({error}). Safe to continue; the next attempt uses the {} tier with a {} prompt{}.",
                part.retry_count,
                policy.max_attempts(),
                next.tier,
                next.verbosity,
                if class == ErrorClass::ParseValidation {
                    " and a stricter output format"
                } else {
                    ""
                },
            );
            let retry_count = part.retry_count;
            self.store
                .update(
                    job_id,
                    JobPatch::new()
                        .status(JobStatus::Stalled)
                        .error(code, detail)
                        .upsert_part(part),
                )
                .await?;
            warn!(substage = %label, error_code = code, retry_count, "job stalled");
            return Ok(ContinueOutcome::Stalled {
                error_code: code.to_string(),
                retry_count,
            });
        }

        match chunk {
            Some(spec) if class == ErrorClass::ParseValidation => {
                warn!(
                    chunk = spec.index,
                    substage = %label,
                    "chunk exhausted on unparseable output, committing template beats"
                );
                part.complete_chunk(spec.index, spec.positions().map(placeholder_beat));
                self.commit(fresh, Some(part), label, heartbeat).await
            }
            None if class == ErrorClass::ParseValidation && part.name == Substep::Scaffold.name() => {
                warn!(
                    substage = %label,
                    act_count = self.config.shape.act_count,
                    "scaffold exhausted on unparseable output, committing template acts"
                );
                part.complete_with(template_scaffold(self.config.shape.act_count));
                self.commit(fresh, Some(part), label, heartbeat).await
            }
            _ => {
                let attempts = part.retry_count;
                self.fail_exhausted(fresh, part, &label, attempts).await
            }
        }
    }

    async fn fail_exhausted(
        &self,
        fresh: &JobRecord,
        mut part: StagePart,
        label: &str,
        attempts: u32,
    ) -> Result<ContinueOutcome, OrchestratorError> {
        let last = part
            .last_failure
            .as_ref()
            .map(|f| f.detail.clone())
            .unwrap_or_else(|| "unknown".to_string());
        part.status = PartStatus::Failed;
        part.updated_at = Utc::now();
        let detail = format!(
            "{label} failed {attempts} attempts (last error: {last}). Will not succeed without a reset."
        );
        self.store
            .update(
                fresh.id,
                JobPatch::new()
                    .status(JobStatus::Failed)
                    .error(MAX_RETRIES, detail)
                    .upsert_part(part),
            )
            .await?;
        warn!(substage = %label, error_code = MAX_RETRIES, attempts, "job failed");
        Ok(ContinueOutcome::Failed {
            error_code: MAX_RETRIES.to_string(),
        })
    }

    async fn merge_and_finish(&self, record: &JobRecord) -> Result<ContinueOutcome, OrchestratorError> {
        let shape = self.config.shape;
        let empty = BTreeMap::new();
        let beats = record
            .parts
            .get(Substep::Beats.name())
            .and_then(|p| p.chunks.as_ref())
            .map(|c| &c.beats)
            .unwrap_or(&empty);

        let artifact = ArtifactBuilder::new(shape)
            .summary(done_data(&record.parts, Substep::Summary))
            .scaffold(done_data(&record.parts, Substep::Scaffold))
            .beats(beats)
            .build();
        let verdict = self.qc.validate(&artifact);

        if verdict.passed {
            self.store
                .update(
                    record.id,
                    JobPatch::new()
                        .status(JobStatus::Completed)
                        .stage(Stage::Done)
                        .substage("done")
                        .progress(100)
                        .clear_error()
                        .qc(Some(verdict.clone()))
                        .artifact(Some(artifact)),
                )
                .await?;
            info!(quality = ?verdict.quality, score = verdict.score, "job completed");
            return Ok(ContinueOutcome::Completed { verdict });
        }

        let detail = format!(
            "QC rejected the merged outline: {}. Regenerating needs a hard reset.",
            verdict.issues.join("; ")
        );
        self.store
            .update(
                record.id,
                JobPatch::new()
                    .status(JobStatus::Failed)
                    .stage(Stage::Merge)
                    .substage("qc")
                    .error(QC_REJECTED, detail)
                    .qc(Some(verdict))
                    .artifact(Some(artifact)),
            )
            .await?;
        warn!(error_code = QC_REJECTED, "job failed");
        Ok(ContinueOutcome::Failed {
            error_code: QC_REJECTED.to_string(),
        })
    }
}

fn done_data(parts: &BTreeMap<String, StagePart>, substep: Substep) -> Option<&JsonValue> {
    parts
        .get(substep.name())
        .filter(|p| p.is_done())
        .and_then(|p| p.data.as_ref())
}

/// Progress from committed parts: summary 10, scaffold 10, beats 75 spread
/// over chunks. Capped at 95 until merge completes the job.
pub fn compute_progress(
    shape: &OutlineShape,
    parts: &BTreeMap<String, StagePart>,
    hashes: &SubstepHashes,
) -> u8 {
    let current = |s: Substep| parts.get(s.name()).filter(|p| p.hash == hashes.get(s));
    let trusted = |s: Substep| {
        current(s).is_some_and(|p| p.is_done() && meets_minimum(s, p, shape))
    };
    let mut pct = 0u32;
    if trusted(Substep::Summary) {
        pct += 10;
    }
    if trusted(Substep::Scaffold) {
        pct += 10;
    }
    let total = shape.chunks_total().max(1);
    let chunks_done = current(Substep::Beats)
        .and_then(|p| p.chunks.as_ref())
        .map(|c| c.chunks_done.len() as u32)
        .unwrap_or(0)
        .min(total);
    pct += 75 * chunks_done / total;
    pct.min(95) as u8
}
