//! Static pipeline plan: stages, sub-steps and chunk geometry.

use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use draftmill_core::{DomainError, DomainResult};

use crate::record::Stage;

/// Named unit of generation inside a stage.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Substep {
    /// Summarize: title, logline, synopsis, themes. One call.
    Summary,
    /// Outline: the act scaffold. One call.
    Scaffold,
    /// Outline: every beat, generated in chunks.
    Beats,
}

impl Substep {
    /// Declared execution order.
    pub const ORDER: [Substep; 3] = [Substep::Summary, Substep::Scaffold, Substep::Beats];

    pub fn name(&self) -> &'static str {
        match self {
            Substep::Summary => "summary",
            Substep::Scaffold => "scaffold",
            Substep::Beats => "beats",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Substep::Summary => Stage::Summarize,
            Substep::Scaffold | Substep::Beats => Stage::Outline,
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, Substep::Beats)
    }
}

impl std::fmt::Display for Substep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Expected shape of the outline.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutlineShape {
    /// Exact number of acts.
    pub act_count: u32,
    /// Total beats across the outline.
    pub beat_count: u32,
    /// Beats requested per provider call.
    pub beats_per_chunk: u32,
}

impl Default for OutlineShape {
    fn default() -> Self {
        Self {
            act_count: 3,
            beat_count: 10,
            beats_per_chunk: 2,
        }
    }
}

impl OutlineShape {
    pub fn validate(&self) -> DomainResult<()> {
        if self.act_count == 0 {
            return Err(DomainError::validation("act_count must be positive"));
        }
        if self.beats_per_chunk == 0 {
            return Err(DomainError::validation("beats_per_chunk must be positive"));
        }
        if self.beat_count < self.act_count {
            return Err(DomainError::validation(format!(
                "beat_count ({}) must be at least act_count ({})",
                self.beat_count, self.act_count
            )));
        }
        Ok(())
    }

    pub fn chunks_total(&self) -> u32 {
        self.beat_count.div_ceil(self.beats_per_chunk.max(1))
    }

    /// Geometry of the 1-based chunk `index`, if it exists.
    pub fn chunk(&self, index: u32) -> Option<ChunkSpec> {
        if index == 0 || index > self.chunks_total() {
            return None;
        }
        let first = (index - 1) * self.beats_per_chunk + 1;
        let last = (first + self.beats_per_chunk - 1).min(self.beat_count);
        Some(ChunkSpec {
            index,
            total: self.chunks_total(),
            first_position: first,
            last_position: last,
            beat_count: self.beat_count,
        })
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkSpec> + '_ {
        (1..=self.chunks_total()).filter_map(|i| self.chunk(i))
    }
}

/// One chunk of the beats sub-step.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub index: u32,
    pub total: u32,
    pub first_position: u32,
    pub last_position: u32,
    pub beat_count: u32,
}

impl ChunkSpec {
    pub fn positions(&self) -> RangeInclusive<u32> {
        self.first_position..=self.last_position
    }

    pub fn len(&self) -> u32 {
        self.last_position + 1 - self.first_position
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, position: u32) -> bool {
        self.positions().contains(&position)
    }

    /// Human-readable label, e.g. `beats 5-6 of 10`.
    pub fn label(&self) -> String {
        if self.first_position == self.last_position {
            format!("beat {} of {}", self.first_position, self.beat_count)
        } else {
            format!(
                "beats {}-{} of {}",
                self.first_position, self.last_position, self.beat_count
            )
        }
    }
}
