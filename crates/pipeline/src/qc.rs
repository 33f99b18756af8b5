//! Quality control of the merged artifact.
//!
//! Structural checks run first and short-circuit: any blocker rejects the
//! artifact without running the semantic pass. The semantic pass scores
//! the text against a deny-list of filler phrases.

use serde::{Deserialize, Serialize};

use crate::merge::Artifact;
use crate::plan::OutlineShape;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Ok,
    Degraded,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcVerdict {
    pub passed: bool,
    pub quality: Quality,
    pub issues: Vec<String>,
    pub score: u32,
}

impl QcVerdict {
    fn rejected(issues: Vec<String>) -> Self {
        Self {
            passed: false,
            quality: Quality::Rejected,
            issues,
            score: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QcConfig {
    pub min_beats_per_act: u32,
    pub min_logline_chars: usize,
    pub min_synopsis_chars: usize,
    /// Matched case-insensitively as substrings.
    pub deny_phrases: Vec<String>,
    pub penalty_per_match: u32,
    /// Scores at or above this are `ok`, below are `degraded`.
    pub ok_threshold: u32,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            min_beats_per_act: 2,
            min_logline_chars: 20,
            min_synopsis_chars: 80,
            deny_phrases: [
                "to be determined",
                "lorem ipsum",
                "something happens",
                "in a world where",
                "little do they know",
                "everything changes",
                "a journey of self-discovery",
                "against all odds",
                "only time will tell",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            penalty_per_match: 10,
            ok_threshold: 80,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QcValidator {
    shape: OutlineShape,
    config: QcConfig,
}

impl QcValidator {
    pub fn new(shape: OutlineShape, config: QcConfig) -> Self {
        Self { shape, config }
    }

    pub fn validate(&self, artifact: &Artifact) -> QcVerdict {
        let blockers = self.structural_blockers(artifact);
        if !blockers.is_empty() {
            return QcVerdict::rejected(blockers);
        }

        let mut issues = Vec::new();
        let mut penalty = 0u32;
        for (location, text) in texts(artifact) {
            let lowered = text.to_lowercase();
            for phrase in &self.config.deny_phrases {
                if lowered.contains(phrase.as_str()) {
                    issues.push(format!("{location} contains filler phrase \"{phrase}\""));
                    penalty = penalty.saturating_add(self.config.penalty_per_match);
                }
            }
        }
        let degraded = artifact.degraded_positions();
        for position in &degraded {
            issues.push(format!("beat {position} was filled from the fallback template"));
        }
        let degraded_acts = artifact.degraded_acts();
        for number in &degraded_acts {
            issues.push(format!("act {number} was filled from the fallback template"));
        }

        // Template content always caps quality at degraded.
        let score = 100u32.saturating_sub(penalty);
        let templated = !degraded.is_empty() || !degraded_acts.is_empty();
        let quality = if score >= self.config.ok_threshold && !templated {
            Quality::Ok
        } else {
            Quality::Degraded
        };
        QcVerdict {
            passed: true,
            quality,
            issues,
            score,
        }
    }

    fn structural_blockers(&self, artifact: &Artifact) -> Vec<String> {
        let mut blockers = Vec::new();

        if artifact.acts.len() as u32 != self.shape.act_count {
            blockers.push(format!(
                "expected {} acts, found {}",
                self.shape.act_count,
                artifact.acts.len()
            ));
        }
        if artifact.logline.chars().count() < self.config.min_logline_chars {
            blockers.push(format!(
                "logline is shorter than {} characters",
                self.config.min_logline_chars
            ));
        }
        if artifact.synopsis.chars().count() < self.config.min_synopsis_chars {
            blockers.push(format!(
                "synopsis is shorter than {} characters",
                self.config.min_synopsis_chars
            ));
        }
        for act in &artifact.acts {
            if act.title.trim().is_empty() {
                blockers.push(format!("act {} has no title", act.number));
            }
            if (act.beats.len() as u32) < self.config.min_beats_per_act {
                blockers.push(format!(
                    "act {} has {} beats, minimum {}",
                    act.number,
                    act.beats.len(),
                    self.config.min_beats_per_act
                ));
            }
            for beat in &act.beats {
                if beat.description.trim().is_empty() {
                    blockers.push(format!("beat {} has no description", beat.position));
                }
            }
        }
        blockers
    }
}

fn texts(artifact: &Artifact) -> Vec<(String, &str)> {
    let mut out = vec![
        ("logline".to_string(), artifact.logline.as_str()),
        ("synopsis".to_string(), artifact.synopsis.as_str()),
    ];
    for act in &artifact.acts {
        out.push((format!("act {} summary", act.number), act.summary.as_str()));
        for beat in &act.beats {
            out.push((format!("beat {}", beat.position), beat.description.as_str()));
        }
    }
    out
}
