//! Deterministic assembly of the final artifact.
//!
//! Merge makes no provider calls. It combines the stored summary, act
//! scaffold and beats, tolerating missing pieces: optional fields get
//! explicit placeholders, while logline and synopsis are left empty for QC
//! to reject.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

use crate::plan::OutlineShape;
use crate::record::Beat;

/// Text used wherever an optional field is missing.
pub const PLACEHOLDER_TEXT: &str = "To be determined.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Act {
    pub number: u32,
    pub title: String,
    pub summary: String,
    pub beats: Vec<Beat>,
    /// Title and summary came from the fallback template.
    #[serde(default)]
    pub degraded: bool,
}

/// The finished outline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub title: String,
    pub logline: String,
    pub synopsis: String,
    pub themes: Vec<String>,
    pub acts: Vec<Act>,
}

impl Artifact {
    pub fn beats(&self) -> impl Iterator<Item = &Beat> {
        self.acts.iter().flat_map(|a| a.beats.iter())
    }

    pub fn degraded_positions(&self) -> Vec<u32> {
        self.beats().filter(|b| b.degraded).map(|b| b.position).collect()
    }

    pub fn degraded_acts(&self) -> Vec<u32> {
        self.acts.iter().filter(|a| a.degraded).map(|a| a.number).collect()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SummaryDoc {
    title: String,
    logline: String,
    synopsis: String,
    themes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScaffoldAct {
    title: String,
    summary: String,
    degraded: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ScaffoldDoc {
    acts: Vec<ScaffoldAct>,
}

pub struct ArtifactBuilder {
    shape: OutlineShape,
    summary: SummaryDoc,
    acts: Vec<ScaffoldAct>,
    beats: BTreeMap<u32, Beat>,
}

impl ArtifactBuilder {
    pub fn new(shape: OutlineShape) -> Self {
        Self {
            shape,
            summary: SummaryDoc::default(),
            acts: Vec::new(),
            beats: BTreeMap::new(),
        }
    }

    /// Unreadable input is treated as missing.
    pub fn summary(mut self, value: Option<&JsonValue>) -> Self {
        self.summary = value
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        self
    }

    pub fn scaffold(mut self, value: Option<&JsonValue>) -> Self {
        self.acts = value
            .and_then(|v| serde_json::from_value::<ScaffoldDoc>(v.clone()).ok())
            .map(|doc| doc.acts)
            .unwrap_or_default();
        self
    }

    pub fn beats(mut self, beats: &BTreeMap<u32, Beat>) -> Self {
        self.beats = beats.clone();
        self
    }

    pub fn build(self) -> Artifact {
        let act_total = if self.acts.is_empty() {
            self.shape.act_count
        } else {
            self.acts.len() as u32
        };
        let spans = act_spans(self.shape.beat_count, act_total);

        let acts = spans
            .into_iter()
            .enumerate()
            .map(|(i, span)| {
                let number = i as u32 + 1;
                let scaffold = self.acts.get(i);
                Act {
                    number,
                    title: scaffold
                        .map(|a| a.title.trim())
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("Act {number}")),
                    summary: scaffold
                        .map(|a| a.summary.trim())
                        .filter(|s| !s.is_empty())
                        .unwrap_or(PLACEHOLDER_TEXT)
                        .to_string(),
                    beats: span
                        .map(|position| {
                            self.beats
                                .get(&position)
                                .cloned()
                                .unwrap_or_else(|| placeholder_beat(position))
                        })
                        .collect(),
                    degraded: scaffold.is_some_and(|a| a.degraded),
                }
            })
            .collect();

        let title = self.summary.title.trim();
        Artifact {
            title: if title.is_empty() {
                "Untitled".to_string()
            } else {
                title.to_string()
            },
            logline: self.summary.logline.trim().to_string(),
            synopsis: self.summary.synopsis.trim().to_string(),
            themes: self
                .summary
                .themes
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            acts,
        }
    }
}

/// Template beat for a position that could not be generated.
pub fn placeholder_beat(position: u32) -> Beat {
    Beat {
        position,
        title: format!("Beat {position}"),
        description: PLACEHOLDER_TEXT.to_string(),
        degraded: true,
    }
}

/// Scaffold stored when no well-formed act list could be generated.
pub fn template_scaffold(act_count: u32) -> JsonValue {
    json!({
        "acts": (1..=act_count)
            .map(|n| json!({
                "title": format!("Act {n}"),
                "summary": PLACEHOLDER_TEXT,
                "degraded": true,
            }))
            .collect::<Vec<_>>(),
    })
}

/// Split positions `1..=beat_count` into `act_count` contiguous spans whose
/// sizes differ by at most one; earlier acts take the remainder.
pub fn act_spans(beat_count: u32, act_count: u32) -> Vec<RangeInclusive<u32>> {
    if act_count == 0 {
        return Vec::new();
    }
    let base = beat_count / act_count;
    let extra = beat_count % act_count;
    let mut next = 1;
    (0..act_count)
        .map(|i| {
            let len = base + u32::from(i < extra);
            let span = next..=next + len - 1;
            next += len;
            span
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn beats(n: u32) -> BTreeMap<u32, Beat> {
        (1..=n)
            .map(|p| {
                (
                    p,
                    Beat {
                        position: p,
                        title: format!("B{p}"),
                        description: format!("beat {p}"),
                        degraded: false,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn spans_distribute_remainder_to_early_acts() {
        assert_eq!(act_spans(10, 3), vec![1..=4, 5..=7, 8..=10]);
        assert_eq!(act_spans(6, 3), vec![1..=2, 3..=4, 5..=6]);
        assert!(act_spans(5, 0).is_empty());
    }

    #[test]
    fn full_inputs_build_complete_artifact() {
        let artifact = ArtifactBuilder::new(OutlineShape::default())
            .summary(Some(&json!({
                "title": "Salt",
                "logline": "A diver finds a door on the seabed.",
                "synopsis": "Long synopsis.",
                "themes": ["grief", " "]
            })))
            .scaffold(Some(&json!({"acts": [
                {"title": "Descent", "summary": "s1"},
                {"title": "Door", "summary": "s2"},
                {"title": "Ascent", "summary": "s3"}
            ]})))
            .beats(&beats(10))
            .build();

        assert_eq!(artifact.title, "Salt");
        assert_eq!(artifact.themes, vec!["grief".to_string()]);
        assert_eq!(artifact.acts.len(), 3);
        assert_eq!(artifact.acts[0].beats.len(), 4);
        assert_eq!(artifact.acts[2].title, "Ascent");
        assert!(artifact.degraded_positions().is_empty());
    }

    #[test]
    fn missing_inputs_get_placeholders_but_empty_narrative() {
        let artifact = ArtifactBuilder::new(OutlineShape::default())
            .summary(None)
            .scaffold(Some(&json!("not an object")))
            .beats(&beats(4))
            .build();

        assert_eq!(artifact.title, "Untitled");
        assert!(artifact.logline.is_empty());
        assert!(artifact.synopsis.is_empty());
        assert_eq!(artifact.acts.len(), 3);
        assert_eq!(artifact.acts[1].title, "Act 2");
        assert_eq!(artifact.acts[1].summary, PLACEHOLDER_TEXT);
        assert_eq!(artifact.degraded_positions(), vec![5, 6, 7, 8, 9, 10]);
        assert!(artifact.degraded_acts().is_empty());
    }

    #[test]
    fn template_scaffold_marks_every_act() {
        let artifact = ArtifactBuilder::new(OutlineShape::default())
            .scaffold(Some(&template_scaffold(3)))
            .beats(&beats(10))
            .build();

        assert_eq!(artifact.degraded_acts(), vec![1, 2, 3]);
        assert_eq!(artifact.acts[2].title, "Act 3");
        assert!(artifact.degraded_positions().is_empty());
    }
}
