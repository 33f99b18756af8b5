//! Idempotency keys and the memoized-execution helper.
//!
//! A sub-step's key hashes its semantic inputs: the brief or upstream output
//! it consumes, the configuration that shapes it, and its own name. Equal
//! keys mean the stored result can be reused without a provider call.

use std::collections::BTreeMap;
use std::future::Future;

use serde_json::{Value as JsonValue, json};
use sha2::{Digest, Sha256};

use crate::plan::{OutlineShape, Substep};
use crate::record::{GenerationBrief, StagePart};

/// Bumped whenever prompt wording changes in a way that should invalidate memoized results.
pub const PROMPT_REVISION: u32 = 1;

/// Hex SHA-256 of the canonical JSON of `(input, config, substep)`.
///
/// `serde_json::Map` keeps keys sorted, so serialization is canonical.
pub fn idempotency_hash(substep: Substep, input: &JsonValue, config: &JsonValue) -> String {
    let canonical = json!({
        "input": input,
        "config": config,
        "substep": substep.name(),
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn config_fingerprint(shape: &OutlineShape) -> JsonValue {
    json!({
        "prompt_revision": PROMPT_REVISION,
        "act_count": shape.act_count,
        "beat_count": shape.beat_count,
        "beats_per_chunk": shape.beats_per_chunk,
    })
}

/// Expected idempotency key of every sub-step for the current record.
///
/// Keys cascade: scaffold hashes the stored summary and beats hash both the
/// summary and the scaffold, so regenerating an upstream step invalidates
/// everything below it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstepHashes(BTreeMap<Substep, String>);

impl SubstepHashes {
    pub fn compute(
        brief: &GenerationBrief,
        shape: &OutlineShape,
        parts: &BTreeMap<String, StagePart>,
    ) -> Self {
        let config = config_fingerprint(shape);
        let done_data = |substep: Substep| -> JsonValue {
            parts
                .get(substep.name())
                .filter(|p| p.is_done())
                .and_then(|p| p.data.clone())
                .unwrap_or(JsonValue::Null)
        };

        let brief_json = serde_json::to_value(brief).unwrap_or(JsonValue::Null);
        let summary = done_data(Substep::Summary);
        let scaffold = done_data(Substep::Scaffold);

        let mut hashes = BTreeMap::new();
        hashes.insert(
            Substep::Summary,
            idempotency_hash(Substep::Summary, &json!({ "brief": brief_json }), &config),
        );
        hashes.insert(
            Substep::Scaffold,
            idempotency_hash(
                Substep::Scaffold,
                &json!({ "brief": brief_json, "summary": summary }),
                &config,
            ),
        );
        hashes.insert(
            Substep::Beats,
            idempotency_hash(
                Substep::Beats,
                &json!({ "brief": brief_json, "summary": summary, "scaffold": scaffold }),
                &config,
            ),
        );
        Self(hashes)
    }

    pub fn get(&self, substep: Substep) -> &str {
        self.0.get(&substep).map(String::as_str).unwrap_or_default()
    }
}

/// Result of [`run_if_needed`].
#[derive(Debug, Clone, PartialEq)]
pub enum Memoized<T> {
    /// A stored result with a matching key was reused.
    Cached(T),
    /// The generator ran.
    Fresh(T),
}

impl<T> Memoized<T> {
    pub fn is_cached(&self) -> bool {
        matches!(self, Memoized::Cached(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Memoized::Cached(v) | Memoized::Fresh(v) => v,
        }
    }
}

/// Reuse `existing` when it is done under `hash`; otherwise run `generator`.
pub async fn run_if_needed<F, Fut, E>(
    existing: Option<&StagePart>,
    hash: &str,
    generator: F,
) -> Result<Memoized<JsonValue>, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<JsonValue, E>>,
{
    if let Some(data) = existing
        .filter(|p| p.hash == hash && p.is_done())
        .and_then(|p| p.data.clone())
    {
        return Ok(Memoized::Cached(data));
    }
    generator().await.map(Memoized::Fresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brief() -> GenerationBrief {
        GenerationBrief::new("A lighthouse keeper hears a ship that sank decades ago", "gothic", "slow")
    }

    #[test]
    fn hash_is_stable_and_input_sensitive() {
        let shape = OutlineShape::default();
        let parts = BTreeMap::new();
        let a = SubstepHashes::compute(&brief(), &shape, &parts);
        let b = SubstepHashes::compute(&brief(), &shape, &parts);
        assert_eq!(a, b);
        assert_eq!(a.get(Substep::Summary).len(), 64);

        let other = SubstepHashes::compute(&brief().with_audience("teens"), &shape, &parts);
        assert_ne!(a.get(Substep::Summary), other.get(Substep::Summary));
    }

    #[test]
    fn upstream_result_cascades_into_downstream_keys() {
        let shape = OutlineShape::default();
        let mut parts = BTreeMap::new();
        let before = SubstepHashes::compute(&brief(), &shape, &parts);

        let mut summary = StagePart::pending("summary", before.get(Substep::Summary));
        summary.complete_with(json!({"logline": "x"}));
        parts.insert("summary".to_string(), summary);
        let after = SubstepHashes::compute(&brief(), &shape, &parts);

        assert_eq!(before.get(Substep::Summary), after.get(Substep::Summary));
        assert_ne!(before.get(Substep::Scaffold), after.get(Substep::Scaffold));
        assert_ne!(before.get(Substep::Beats), after.get(Substep::Beats));
    }

    #[tokio::test]
    async fn cached_result_skips_generator() {
        let mut part = StagePart::pending("summary", "k");
        part.complete_with(json!({"logline": "kept"}));

        let out = run_if_needed(Some(&part), "k", || async {
            Err::<JsonValue, &str>("generator must not run")
        })
        .await;
        assert_eq!(out, Ok(Memoized::Cached(json!({"logline": "kept"}))));
    }

    #[tokio::test]
    async fn mismatched_hash_runs_generator() {
        let mut part = StagePart::pending("summary", "old");
        part.complete_with(json!({"logline": "stale"}));

        let out = run_if_needed(Some(&part), "new", || async {
            Ok::<JsonValue, ()>(json!({"logline": "fresh"}))
        })
        .await
        .unwrap();
        assert!(!out.is_cached());
        assert_eq!(out.into_inner(), json!({"logline": "fresh"}));
    }
}
