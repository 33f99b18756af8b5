//! Resume point detection.
//!
//! Pure function of the stored parts: where should the next invocation pick
//! up? A part only counts as complete when it is marked done under the
//! expected idempotency key *and* carries the structural minimum of its
//! sub-step. Anything less is redone.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::memo::SubstepHashes;
use crate::plan::{ChunkSpec, OutlineShape, Substep};
use crate::record::{Beat, Stage, StagePart};

/// Next chunk to run plus everything already accumulated for the sub-step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCursor {
    pub spec: ChunkSpec,
    pub accumulated: BTreeMap<u32, Beat>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePoint {
    /// Run one unit of `substep`; `chunk` is set for chunked sub-steps.
    Run {
        substep: Substep,
        chunk: Option<ChunkCursor>,
    },
    /// Every generating sub-step is complete.
    Merge,
}

impl ResumePoint {
    pub fn stage(&self) -> Stage {
        match self {
            ResumePoint::Run { substep, .. } => substep.stage(),
            ResumePoint::Merge => Stage::Merge,
        }
    }

    /// Label persisted as the job's `substage`.
    pub fn label(&self) -> String {
        match self {
            ResumePoint::Run {
                chunk: Some(cursor),
                ..
            } => cursor.spec.label(),
            ResumePoint::Run { substep, .. } => substep.name().to_string(),
            ResumePoint::Merge => "merge".to_string(),
        }
    }
}

pub fn detect_resume_point(
    shape: &OutlineShape,
    parts: &BTreeMap<String, StagePart>,
    hashes: &SubstepHashes,
) -> ResumePoint {
    for substep in Substep::ORDER {
        let part = parts
            .get(substep.name())
            .filter(|p| p.hash == hashes.get(substep));

        if part.is_some_and(|p| p.is_done() && meets_minimum(substep, p, shape)) {
            continue;
        }

        let chunk = substep
            .is_chunked()
            .then(|| next_chunk(shape, part))
            .flatten();
        return ResumePoint::Run { substep, chunk };
    }
    ResumePoint::Merge
}

/// First chunk whose index is not committed or whose positions are not all
/// present. Indices are scanned from 1, so with contiguous progress this is
/// `chunks_done.len() + 1`.
fn next_chunk(shape: &OutlineShape, part: Option<&StagePart>) -> Option<ChunkCursor> {
    let state = part.and_then(|p| p.chunks.as_ref());
    let accumulated = state.map(|s| s.beats.clone()).unwrap_or_default();

    let spec = shape.chunks().find(|spec| {
        let committed = state.is_some_and(|s| s.chunks_done.contains(&spec.index));
        !committed || !spec.positions().all(|p| accumulated.contains_key(&p))
    })?;

    Some(ChunkCursor { spec, accumulated })
}

/// Structural minimum a done part must carry before it is trusted.
pub fn meets_minimum(substep: Substep, part: &StagePart, shape: &OutlineShape) -> bool {
    match substep {
        Substep::Summary => part.data.as_ref().is_some_and(|d| {
            non_empty_str(d, "logline") && non_empty_str(d, "synopsis")
        }),
        Substep::Scaffold => part
            .data
            .as_ref()
            .and_then(|d| d.get("acts"))
            .and_then(JsonValue::as_array)
            .is_some_and(|acts| acts.len() as u32 >= shape.act_count),
        Substep::Beats => part
            .chunks
            .as_ref()
            .is_some_and(|c| (1..=shape.beat_count).all(|p| c.beats.contains_key(&p))),
    }
}

fn non_empty_str(value: &JsonValue, key: &str) -> bool {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .is_some_and(|s| !s.trim().is_empty())
}
