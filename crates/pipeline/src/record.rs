//! The Job Record: durable pipeline state.
//!
//! The record is the single source of truth. An orchestrator invocation
//! rebuilds its whole plan from it and trusts nothing held in memory from a
//! previous invocation.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use draftmill_core::{DomainError, DomainResult, JobId};
use draftmill_providers::ErrorClass;

use crate::merge::Artifact;
use crate::qc::QcVerdict;

/// Job status exposed upward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, no invocation yet.
    Queued,
    /// An invocation is running or more work remains.
    Generating,
    /// A retryable failure was recorded; safe and expected to call `continue` again.
    Stalled,
    /// Terminal; no invocation will make progress without a manual reset.
    Failed,
    /// Terminal; QC ran and the artifact is attached.
    Completed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Generating => "generating",
            JobStatus::Stalled => "stalled",
            JobStatus::Failed => "failed",
            JobStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage, in declared order.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    None,
    Summarize,
    Outline,
    Merge,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::None => "none",
            Stage::Summarize => "summarize",
            Stage::Outline => "outline",
            Stage::Merge => "merge",
            Stage::Done => "done",
        }
    }
}

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationBrief {
    pub premise: String,
    pub genre: String,
    pub tone: String,
    #[serde(default)]
    pub audience: Option<String>,
}

impl GenerationBrief {
    pub fn new(premise: impl Into<String>, genre: impl Into<String>, tone: impl Into<String>) -> Self {
        Self {
            premise: premise.into(),
            genre: genre.into(),
            tone: tone.into(),
            audience: None,
        }
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.premise.trim().len() < 10 {
            return Err(DomainError::validation(
                "premise must be at least 10 characters",
            ));
        }
        if self.genre.trim().is_empty() {
            return Err(DomainError::validation("genre is required"));
        }
        if self.tone.trim().is_empty() {
            return Err(DomainError::validation("tone is required"));
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartStatus {
    Pending,
    Partial,
    Done,
    Failed,
}

/// One generated beat, keyed by its 1-based position in the outline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Beat {
    pub position: u32,
    pub title: String,
    pub description: String,
    /// Filled from the fallback template rather than generated.
    #[serde(default)]
    pub degraded: bool,
}

/// Last failure of the current unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNote {
    pub code: String,
    pub class: ErrorClass,
    pub detail: String,
    /// Chunk the failed attempt was generating, for chunked sub-steps.
    #[serde(default)]
    pub chunk: Option<u32>,
    pub at: DateTime<Utc>,
}

/// Chunk checkpoints of a chunked sub-step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkState {
    pub chunks_total: u32,
    /// 1-based chunk indices committed so far. Only ever grows.
    pub chunks_done: BTreeSet<u32>,
    pub current_chunk: u32,
    /// Accumulated results keyed by position.
    pub beats: BTreeMap<u32, Beat>,
}

impl ChunkState {
    pub fn new(chunks_total: u32) -> Self {
        Self {
            chunks_total,
            chunks_done: BTreeSet::new(),
            current_chunk: 1,
            beats: BTreeMap::new(),
        }
    }

    /// Commit a chunk's beats. Beats at an existing key are overwritten.
    pub fn record_chunk(&mut self, index: u32, beats: impl IntoIterator<Item = Beat>) {
        for beat in beats {
            self.beats.insert(beat.position, beat);
        }
        self.chunks_done.insert(index);
        self.current_chunk = self.next_pending().unwrap_or(self.chunks_total);
    }

    pub fn is_complete(&self) -> bool {
        self.chunks_done.len() as u32 >= self.chunks_total
    }

    /// First chunk index not yet committed.
    pub fn next_pending(&self) -> Option<u32> {
        (1..=self.chunks_total).find(|i| !self.chunks_done.contains(i))
    }

    fn merge_from(&mut self, incoming: ChunkState) {
        self.chunks_total = self.chunks_total.max(incoming.chunks_total);
        self.chunks_done.extend(incoming.chunks_done);
        self.beats.extend(incoming.beats);
        self.current_chunk = self.next_pending().unwrap_or(self.chunks_total);
    }
}

/// Checkpoint of one named sub-step ("summary", "scaffold", "beats").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagePart {
    pub name: String,
    pub status: PartStatus,
    /// Idempotency key: hash of the semantic inputs of this sub-step.
    pub hash: String,
    /// Memoized result once `status = done` (unchunked sub-steps).
    #[serde(default)]
    pub data: Option<JsonValue>,
    #[serde(default)]
    pub chunks: Option<ChunkState>,
    /// Failed attempts of the current unit (the single call, or the current chunk).
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_failure: Option<FailureNote>,
    pub updated_at: DateTime<Utc>,
}

impl StagePart {
    pub fn pending(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: PartStatus::Pending,
            hash: hash.into(),
            data: None,
            chunks: None,
            retry_count: 0,
            last_failure: None,
            updated_at: Utc::now(),
        }
    }

    pub fn chunked(name: impl Into<String>, hash: impl Into<String>, chunks_total: u32) -> Self {
        Self {
            chunks: Some(ChunkState::new(chunks_total)),
            ..Self::pending(name, hash)
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == PartStatus::Done
    }

    /// Mark an unchunked sub-step done with its result.
    pub fn complete_with(&mut self, data: JsonValue) {
        self.status = PartStatus::Done;
        self.data = Some(data);
        self.retry_count = 0;
        self.last_failure = None;
        self.updated_at = Utc::now();
    }

    /// Commit one chunk; resets the retry counter.
    pub fn complete_chunk(&mut self, index: u32, beats: impl IntoIterator<Item = Beat>) {
        if let Some(chunks) = self.chunks.as_mut() {
            chunks.record_chunk(index, beats);
            self.status = if chunks.is_complete() {
                PartStatus::Done
            } else {
                PartStatus::Partial
            };
        }
        self.retry_count = 0;
        self.last_failure = None;
        self.updated_at = Utc::now();
    }

    /// Merge a (possibly stale) write of the same sub-step into this one.
    ///
    /// With equal hashes, chunk sets are unioned and beats are overlaid by
    /// position, so a racing writer can never shrink `chunks_done` or delete
    /// a keyed beat. A different hash means the inputs changed and the
    /// incoming part replaces this one.
    pub fn absorb(&mut self, incoming: StagePart) {
        if incoming.hash != self.hash {
            *self = incoming;
            return;
        }

        if let (Some(mine), Some(theirs)) = (self.chunks.as_mut(), incoming.chunks.clone()) {
            mine.merge_from(theirs);
            let complete = mine.is_complete();
            let any_done = !mine.chunks_done.is_empty();
            // A failure of a chunk that has since been committed is stale;
            // its retry count belongs to no pending chunk.
            let stale_failure = incoming
                .last_failure
                .as_ref()
                .and_then(|f| f.chunk)
                .is_some_and(|index| mine.chunks_done.contains(&index));
            self.status = match incoming.status {
                PartStatus::Failed if !complete && !stale_failure => PartStatus::Failed,
                _ if complete => PartStatus::Done,
                _ if any_done => PartStatus::Partial,
                other => other,
            };
            if !stale_failure {
                self.retry_count = incoming.retry_count;
                self.last_failure = incoming.last_failure;
            }
            self.updated_at = incoming.updated_at.max(self.updated_at);
            return;
        }

        // A stale failure must not undo a committed result.
        if self.is_done() && !incoming.is_done() {
            return;
        }
        *self = incoming;
    }
}

/// One content-generation request and all of its persisted progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub brief: GenerationBrief,
    pub status: JobStatus,
    pub stage: Stage,
    /// Free-form label of the current unit of work.
    pub substage: String,
    /// Orchestrator invocations consumed.
    pub attempts: u32,
    /// 0-100, non-decreasing except on hard reset.
    pub progress: u8,
    /// Liveness only; never implies progress.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_detail: Option<String>,
    #[serde(default)]
    pub parts: BTreeMap<String, StagePart>,
    #[serde(default)]
    pub qc: Option<QcVerdict>,
    #[serde(default)]
    pub artifact: Option<Artifact>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(brief: GenerationBrief) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            brief,
            status: JobStatus::Queued,
            stage: Stage::None,
            substage: String::new(),
            attempts: 0,
            progress: 0,
            heartbeat_at: None,
            error_code: None,
            error_detail: None,
            parts: BTreeMap::new(),
            qc: None,
            artifact: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = id;
        self
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id,
            status: self.status,
            stage: self.stage,
            substage: self.substage.clone(),
            progress: self.progress,
            attempts: self.attempts,
            error_code: self.error_code.clone(),
            error_detail: self.error_detail.clone(),
            heartbeat_at: self.heartbeat_at,
            updated_at: self.updated_at,
        }
    }

    /// `true` when the job claims to be generating but has not beaten within `threshold`.
    pub fn is_heartbeat_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        if self.status != JobStatus::Generating {
            return false;
        }
        match self.heartbeat_at {
            Some(at) => now - at > threshold,
            None => now - self.updated_at > threshold,
        }
    }
}

/// Status contract exposed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
    pub stage: Stage,
    pub substage: String,
    pub progress: u8,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat(position: u32, title: &str) -> Beat {
        Beat {
            position,
            title: title.to_string(),
            description: format!("{title} happens"),
            degraded: false,
        }
    }

    #[test]
    fn completing_a_chunk_resets_retry_count() {
        let mut part = StagePart::chunked("beats", "h", 3);
        part.retry_count = 2;
        part.complete_chunk(1, vec![beat(1, "a"), beat(2, "b")]);
        assert_eq!(part.retry_count, 0);
        assert_eq!(part.status, PartStatus::Partial);
        assert_eq!(part.chunks.as_ref().unwrap().current_chunk, 2);
    }

    #[test]
    fn stale_write_cannot_shrink_chunks_done() {
        let mut stored = StagePart::chunked("beats", "h", 3);
        stored.complete_chunk(1, vec![beat(1, "a")]);
        stored.complete_chunk(2, vec![beat(2, "b")]);

        let mut stale = StagePart::chunked("beats", "h", 3);
        stale.complete_chunk(1, vec![beat(1, "a2")]);

        stored.absorb(stale);
        let chunks = stored.chunks.as_ref().unwrap();
        assert_eq!(chunks.chunks_done, BTreeSet::from([1, 2]));
        assert_eq!(chunks.beats[&1].title, "a2");
        assert_eq!(chunks.beats[&2].title, "b");
    }

    fn failure_on(index: u32) -> FailureNote {
        FailureNote {
            code: "PROVIDER_TIMEOUT".into(),
            class: ErrorClass::TransientProvider,
            detail: "timed out".into(),
            chunk: Some(index),
            at: Utc::now(),
        }
    }

    #[test]
    fn failure_of_a_committed_chunk_does_not_carry_over() {
        let mut stored = StagePart::chunked("beats", "h", 3);
        stored.complete_chunk(1, vec![beat(1, "a")]);
        stored.complete_chunk(2, vec![beat(2, "b")]);

        // Written by an invocation that read the record before chunk 2 landed.
        let mut stale = StagePart::chunked("beats", "h", 3);
        stale.complete_chunk(1, vec![beat(1, "a")]);
        stale.retry_count = 1;
        stale.last_failure = Some(failure_on(2));
        stored.absorb(stale);

        assert_eq!(stored.chunks.as_ref().unwrap().current_chunk, 3);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.last_failure, None);
        assert_eq!(stored.status, PartStatus::Partial);
    }

    #[test]
    fn failure_of_the_pending_chunk_is_kept() {
        let mut stored = StagePart::chunked("beats", "h", 3);
        stored.complete_chunk(1, vec![beat(1, "a")]);

        let mut failed = stored.clone();
        failed.retry_count = 2;
        failed.status = PartStatus::Failed;
        failed.last_failure = Some(failure_on(2));
        stored.absorb(failed);

        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.status, PartStatus::Failed);
        assert_eq!(stored.last_failure.as_ref().and_then(|f| f.chunk), Some(2));
    }

    #[test]
    fn hash_change_replaces_the_part() {
        let mut stored = StagePart::chunked("beats", "old", 2);
        stored.complete_chunk(1, vec![beat(1, "a")]);
        stored.absorb(StagePart::chunked("beats", "new", 2));
        assert!(stored.chunks.as_ref().unwrap().chunks_done.is_empty());
        assert_eq!(stored.hash, "new");
    }

    #[test]
    fn stale_failure_does_not_undo_done_single_step() {
        let mut stored = StagePart::pending("summary", "h");
        stored.complete_with(serde_json::json!({"logline": "x"}));

        let mut stale = StagePart::pending("summary", "h");
        stale.retry_count = 1;
        stored.absorb(stale);

        assert!(stored.is_done());
        assert_eq!(stored.retry_count, 0);
    }

    #[test]
    fn brief_validation() {
        assert!(GenerationBrief::new("short", "noir", "bleak").validate().is_err());
        assert!(
            GenerationBrief::new("A courier loses the one letter that matters", "noir", "bleak")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn stale_heartbeat_only_matters_while_generating() {
        let mut record = JobRecord::new(GenerationBrief::new("premise long enough", "g", "t"));
        let now = Utc::now();
        record.heartbeat_at = Some(now - chrono::Duration::seconds(120));
        assert!(!record.is_heartbeat_stale(now, chrono::Duration::seconds(60)));
        record.status = JobStatus::Generating;
        assert!(record.is_heartbeat_stale(now, chrono::Duration::seconds(60)));
    }
}
