//! Prompt assembly per sub-step, attempt verbosity and format strictness.

use std::fmt::Write as _;

use serde_json::Value as JsonValue;

use draftmill_providers::{OutputSchema, PromptVerbosity};

use crate::plan::{ChunkSpec, OutlineShape, Substep};
use crate::record::{Beat, GenerationBrief};

/// How many previously generated beats are quoted in a full chunk prompt.
const CONTEXT_BEATS: usize = 3;

const SYSTEM: &str = "You are a story development assistant. You write concrete, specific \
story material and always answer in the requested structure.";

const STRICT_FORMAT: &str = "Your previous answer could not be parsed. Respond with ONLY a \
JSON object matching the schema. No prose, no markdown fences, no commentary.";

/// Everything upstream a prompt may draw on.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub brief: &'a GenerationBrief,
    pub summary: Option<&'a JsonValue>,
    pub scaffold: Option<&'a JsonValue>,
}

#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub schema: OutputSchema,
}

#[derive(Debug, Clone, Copy)]
pub struct PromptBuilder {
    shape: OutlineShape,
}

impl PromptBuilder {
    pub fn new(shape: OutlineShape) -> Self {
        Self { shape }
    }

    pub fn schema_for(&self, substep: Substep, chunk: Option<&ChunkSpec>) -> OutputSchema {
        match substep {
            Substep::Summary => OutputSchema::new("summary")
                .text("title")
                .text("logline")
                .text("synopsis")
                .text_list("themes", 1),
            Substep::Scaffold => OutputSchema::new("scaffold").object_list(
                "acts",
                self.shape.act_count as usize,
                &["title", "summary"],
            ),
            Substep::Beats => OutputSchema::new("beats").object_list(
                "beats",
                chunk.map(|c| c.len() as usize).unwrap_or(1),
                &["position", "title", "description"],
            ),
        }
    }

    pub fn build(
        &self,
        substep: Substep,
        ctx: PromptContext<'_>,
        chunk: Option<(&ChunkSpec, &std::collections::BTreeMap<u32, Beat>)>,
        verbosity: PromptVerbosity,
        strict_format: bool,
    ) -> Prompt {
        let mut system = SYSTEM.to_string();
        if strict_format {
            system.push(' ');
            system.push_str(STRICT_FORMAT);
        }

        let mut user = String::new();
        write_brief(&mut user, ctx.brief, verbosity);

        match substep {
            Substep::Summary => {
                user.push_str(
                    "\nWrite a title, a one-sentence logline, a synopsis of one or two \
                     paragraphs and a short list of themes.",
                );
            }
            Substep::Scaffold => {
                write_summary(&mut user, ctx.summary, verbosity);
                let _ = write!(
                    user,
                    "\nDivide the story into exactly {} acts. Give each act a title and a \
                     summary of what changes in it.",
                    self.shape.act_count
                );
            }
            Substep::Beats => {
                write_summary(&mut user, ctx.summary, verbosity);
                write_acts(&mut user, ctx.scaffold, verbosity);
                if let Some((spec, accumulated)) = chunk {
                    if verbosity == PromptVerbosity::Full {
                        write_recent_beats(&mut user, spec, accumulated);
                    }
                    let _ = write!(
                        user,
                        "\nThe outline has {} beats in total. Write beats {} through {}. \
                         Return each beat with its position number, a short title and a \
                         concrete description.",
                        self.shape.beat_count, spec.first_position, spec.last_position
                    );
                }
            }
        }

        Prompt {
            system,
            user,
            schema: self.schema_for(substep, chunk.map(|(spec, _)| spec)),
        }
    }
}

fn write_brief(out: &mut String, brief: &GenerationBrief, verbosity: PromptVerbosity) {
    let _ = writeln!(out, "Premise: {}", brief.premise.trim());
    let _ = writeln!(out, "Genre: {}", brief.genre.trim());
    if verbosity == PromptVerbosity::Full {
        let _ = writeln!(out, "Tone: {}", brief.tone.trim());
        if let Some(audience) = brief.audience.as_deref() {
            let _ = writeln!(out, "Audience: {}", audience.trim());
        }
    }
}

fn write_summary(out: &mut String, summary: Option<&JsonValue>, verbosity: PromptVerbosity) {
    let Some(summary) = summary else { return };
    let field = |key: &str| summary.get(key).and_then(JsonValue::as_str).unwrap_or("");
    let _ = writeln!(out, "Logline: {}", field("logline"));
    if verbosity == PromptVerbosity::Full {
        let _ = writeln!(out, "Synopsis: {}", field("synopsis"));
    }
}

fn write_acts(out: &mut String, scaffold: Option<&JsonValue>, verbosity: PromptVerbosity) {
    let Some(acts) = scaffold.and_then(|s| s.get("acts")).and_then(JsonValue::as_array) else {
        return;
    };
    out.push_str("Acts:\n");
    for (i, act) in acts.iter().enumerate() {
        let title = act.get("title").and_then(JsonValue::as_str).unwrap_or("");
        match verbosity {
            PromptVerbosity::Full => {
                let summary = act.get("summary").and_then(JsonValue::as_str).unwrap_or("");
                let _ = writeln!(out, "{}. {title}: {summary}", i + 1);
            }
            PromptVerbosity::Compressed => {
                let _ = writeln!(out, "{}. {title}", i + 1);
            }
        }
    }
}

fn write_recent_beats(
    out: &mut String,
    spec: &ChunkSpec,
    accumulated: &std::collections::BTreeMap<u32, Beat>,
) {
    let recent: Vec<&Beat> = accumulated
        .range(..spec.first_position)
        .rev()
        .take(CONTEXT_BEATS)
        .map(|(_, b)| b)
        .collect();
    if recent.is_empty() {
        return;
    }
    out.push_str("Previous beats:\n");
    for beat in recent.into_iter().rev() {
        let _ = writeln!(out, "{}. {}: {}", beat.position, beat.title, beat.description);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn brief() -> GenerationBrief {
        GenerationBrief::new("A chef cooks for a ghost who cannot taste", "comedy", "warm")
            .with_audience("adults")
    }

    #[test]
    fn compressed_prompt_is_shorter_and_drops_tone() {
        let builder = PromptBuilder::new(OutlineShape::default());
        let ctx = PromptContext {
            brief: &brief(),
            summary: None,
            scaffold: None,
        };
        let full = builder.build(Substep::Summary, ctx, None, PromptVerbosity::Full, false);
        let compressed = builder.build(Substep::Summary, ctx, None, PromptVerbosity::Compressed, false);
        assert!(compressed.user.len() < full.user.len());
        assert!(full.user.contains("Tone: warm"));
        assert!(!compressed.user.contains("Tone:"));
    }

    #[test]
    fn strict_format_is_appended_to_system_prompt() {
        let builder = PromptBuilder::new(OutlineShape::default());
        let ctx = PromptContext {
            brief: &brief(),
            summary: None,
            scaffold: None,
        };
        let strict = builder.build(Substep::Summary, ctx, None, PromptVerbosity::Full, true);
        assert!(strict.system.contains("ONLY a JSON object"));
    }

    #[test]
    fn chunk_prompt_names_positions_and_recent_beats() {
        let shape = OutlineShape::default();
        let builder = PromptBuilder::new(shape);
        let mut accumulated = BTreeMap::new();
        for position in 1..=4 {
            accumulated.insert(
                position,
                Beat {
                    position,
                    title: format!("T{position}"),
                    description: "d".into(),
                    degraded: false,
                },
            );
        }
        let spec = shape.chunk(3).unwrap();
        let ctx = PromptContext {
            brief: &brief(),
            summary: None,
            scaffold: None,
        };
        let prompt = builder.build(
            Substep::Beats,
            ctx,
            Some((&spec, &accumulated)),
            PromptVerbosity::Full,
            false,
        );
        assert!(prompt.user.contains("Write beats 5 through 6"));
        assert!(prompt.user.contains("4. T4"));
        assert!(!prompt.user.contains("1. T1"));
        assert_eq!(prompt.schema.name, "beats");
    }
}
