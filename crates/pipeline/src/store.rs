//! Job record storage.
//!
//! Writes are expressed as [`JobPatch`]es applied atomically to the current
//! record, so concurrent invocations merge instead of clobbering each other:
//! scalar fields are last-write-wins, stage parts are upserted by name and
//! merged with [`StagePart::absorb`].

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use draftmill_core::JobId;

use crate::merge::Artifact;
use crate::qc::QcVerdict;
use crate::record::{JobRecord, JobStatus, Stage, StagePart};

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Partial update of a job record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub stage: Option<Stage>,
    pub substage: Option<String>,
    pub attempts: Option<u32>,
    pub progress: Option<u8>,
    pub error_code: Option<Option<String>>,
    pub error_detail: Option<Option<String>>,
    /// Drop every stored part (and progress) before upserting `parts`.
    pub reset_parts: bool,
    /// Parts removed before `parts` are upserted.
    pub discard_parts: Vec<String>,
    pub parts: Vec<StagePart>,
    pub qc: Option<Option<QcVerdict>>,
    pub artifact: Option<Option<Artifact>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn substage(mut self, substage: impl Into<String>) -> Self {
        self.substage = Some(substage.into());
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn error(mut self, code: impl Into<String>, detail: impl Into<String>) -> Self {
        self.error_code = Some(Some(code.into()));
        self.error_detail = Some(Some(detail.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error_code = Some(None);
        self.error_detail = Some(None);
        self
    }

    pub fn upsert_part(mut self, part: StagePart) -> Self {
        self.parts.push(part);
        self
    }

    /// Remove a stored part outright instead of merging into it.
    pub fn discard_part(mut self, name: impl Into<String>) -> Self {
        self.discard_parts.push(name.into());
        self
    }

    pub fn reset_parts(mut self) -> Self {
        self.reset_parts = true;
        self
    }

    pub fn qc(mut self, verdict: Option<QcVerdict>) -> Self {
        self.qc = Some(verdict);
        self
    }

    pub fn artifact(mut self, artifact: Option<Artifact>) -> Self {
        self.artifact = Some(artifact);
        self
    }

    /// Apply to `record` in place.
    ///
    /// Progress never decreases unless `reset_parts` is set. A completed
    /// record only changes through `reset_parts`; any other patch is a late
    /// write from a racing invocation and is dropped.
    pub fn apply_to(self, record: &mut JobRecord, now: DateTime<Utc>) {
        if record.status == JobStatus::Completed && !self.reset_parts {
            return;
        }
        if self.reset_parts {
            record.parts.clear();
            record.progress = 0;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(stage) = self.stage {
            record.stage = stage;
        }
        if let Some(substage) = self.substage {
            record.substage = substage;
        }
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        if let Some(progress) = self.progress {
            record.progress = if self.reset_parts {
                progress
            } else {
                record.progress.max(progress)
            };
        }
        if let Some(code) = self.error_code {
            record.error_code = code;
        }
        if let Some(detail) = self.error_detail {
            record.error_detail = detail;
        }
        for name in &self.discard_parts {
            record.parts.remove(name);
        }
        for part in self.parts {
            match record.parts.get_mut(&part.name) {
                Some(existing) => existing.absorb(part),
                None => {
                    record.parts.insert(part.name.clone(), part);
                }
            }
        }
        if let Some(qc) = self.qc {
            record.qc = qc;
        }
        if let Some(artifact) = self.artifact {
            record.artifact = artifact;
        }
        record.updated_at = now;
    }
}

/// Persistent job state.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Atomically apply `patch` to the stored record.
    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<(), StoreError>;

    /// Liveness write: sets `heartbeat_at` and nothing else.
    async fn touch_heartbeat(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Most recently created first.
    async fn list(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        (**self).insert(record).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        (**self).get(job_id).await
    }

    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<(), StoreError> {
        (**self).update(job_id, patch).await
    }

    async fn touch_heartbeat(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        (**self).touch_heartbeat(job_id, at).await
    }

    async fn list(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        (**self).list(limit).await
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        jobs.insert(record.id, record);
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.read().unwrap().get(&job_id).cloned())
    }

    async fn update(&self, job_id: JobId, patch: JobPatch) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let record = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        patch.apply_to(record, Utc::now());
        Ok(())
    }

    async fn touch_heartbeat(&self, job_id: JobId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let record = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        record.heartbeat_at = Some(at);
        Ok(())
    }

    async fn list(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut records: Vec<JobRecord> = jobs.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Beat, GenerationBrief};

    fn record() -> JobRecord {
        JobRecord::new(GenerationBrief::new(
            "A tugboat captain inherits a haunted harbor",
            "mystery",
            "dry",
        ))
    }

    #[test]
    fn late_writes_never_reopen_a_completed_job() {
        let mut r = record();
        JobPatch::new()
            .status(JobStatus::Completed)
            .progress(100)
            .apply_to(&mut r, Utc::now());
        let done = r.clone();

        JobPatch::new()
            .status(JobStatus::Generating)
            .substage("beats 9-10 of 10")
            .apply_to(&mut r, Utc::now());
        assert_eq!(r, done);

        JobPatch::new()
            .reset_parts()
            .status(JobStatus::Queued)
            .progress(0)
            .apply_to(&mut r, Utc::now());
        assert_eq!(r.status, JobStatus::Queued);
        assert_eq!(r.progress, 0);
    }

    #[test]
    fn discarded_part_is_replaced_not_merged() {
        let mut r = record();
        let mut done = StagePart::pending("summary", "h");
        done.complete_with(serde_json::json!({"logline": ""}));
        JobPatch::new().upsert_part(done).apply_to(&mut r, Utc::now());

        let mut failed = StagePart::pending("summary", "h");
        failed.retry_count = 1;
        JobPatch::new()
            .discard_part("summary")
            .upsert_part(failed)
            .apply_to(&mut r, Utc::now());

        let part = &r.parts["summary"];
        assert!(!part.is_done());
        assert_eq!(part.retry_count, 1);
        assert_eq!(part.data, None);
    }

    fn chunk(index: u32) -> StagePart {
        let mut part = StagePart::chunked("beats", "h", 5);
        let first = (index - 1) * 2 + 1;
        part.complete_chunk(
            index,
            (first..=first + 1).map(|position| Beat {
                position,
                title: format!("t{position}"),
                description: "d".into(),
                degraded: false,
            }),
        );
        part
    }

    #[tokio::test]
    async fn insert_get_and_duplicate() {
        let store = InMemoryJobStore::new();
        let r = record();
        let id = r.id;
        store.insert(r.clone()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), Some(r.clone()));
        assert!(matches!(
            store.insert(r).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(store.get(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_is_monotonic_except_on_reset() {
        let store = InMemoryJobStore::new();
        let r = record();
        let id = r.id;
        store.insert(r).await.unwrap();

        store.update(id, JobPatch::new().progress(40)).await.unwrap();
        store.update(id, JobPatch::new().progress(20)).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().progress, 40);

        store
            .update(id, JobPatch::new().reset_parts().progress(0))
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().progress, 0);
    }

    #[tokio::test]
    async fn concurrent_chunk_commits_merge() {
        let store = InMemoryJobStore::arc();
        let r = record();
        let id = r.id;
        store.insert(r).await.unwrap();

        store.update(id, JobPatch::new().upsert_part(chunk(1))).await.unwrap();
        store.update(id, JobPatch::new().upsert_part(chunk(2))).await.unwrap();
        // Stale writer that only knows about chunk 1.
        store.update(id, JobPatch::new().upsert_part(chunk(1))).await.unwrap();

        let stored = store.get(id).await.unwrap().unwrap();
        let chunks = stored.parts["beats"].chunks.as_ref().unwrap();
        assert_eq!(chunks.chunks_done.iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(chunks.beats.len(), 4);
    }

    #[tokio::test]
    async fn heartbeat_touches_only_heartbeat() {
        let store = InMemoryJobStore::new();
        let r = record();
        let id = r.id;
        store.insert(r.clone()).await.unwrap();

        let at = Utc::now();
        store.touch_heartbeat(id, at).await.unwrap();
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(stored.heartbeat_at, Some(at));
        assert_eq!(stored.updated_at, r.updated_at);
        assert!(matches!(
            store.touch_heartbeat(JobId::new(), at).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
