//! Deterministic offline responses for local runs and tests.
//!
//! The responder answers every sub-step with well-formed structured output
//! derived only from call metadata, so the same job always produces the same
//! artifact.

use serde_json::{Value as JsonValue, json};

use draftmill_providers::{GenerationCall, ProviderError, RawCompletion, ScriptedProvider};

const ACT_NAMES: [&str; 5] = ["Setup", "Confrontation", "Reversal", "Crisis", "Resolution"];

pub fn demo_responder(call: &GenerationCall) -> Result<RawCompletion, ProviderError> {
    let body = match call.substep.as_str() {
        "summary" => json!({
            "title": "The Quiet Ledger",
            "logline": "A reluctant bookkeeper uncovers the debt that holds her town together.",
            "synopsis": "When the town's last bookkeeper inherits a ledger of favors nobody \
                         admits to owing, she must decide which debts to call in before the \
                         harvest festival, knowing each one could tear a family apart.",
            "themes": ["obligation", "community", "memory"],
        }),
        "scaffold" => {
            let acts = meta_u64(call, "act_count").unwrap_or(3);
            json!({
                "acts": (1..=acts)
                    .map(|n| {
                        let name = ACT_NAMES[(n as usize - 1) % ACT_NAMES.len()];
                        json!({
                            "title": name,
                            "summary": format!("Act {n} turns the ledger against a new household."),
                        })
                    })
                    .collect::<Vec<_>>(),
            })
        }
        "beats" => {
            let first = meta_u64(call, "first_position").unwrap_or(1);
            let last = meta_u64(call, "last_position").unwrap_or(first);
            json!({
                "beats": (first..=last)
                    .map(|p| json!({
                        "position": p,
                        "title": format!("Entry {p}"),
                        "description": format!(
                            "The bookkeeper settles entry {p} and a neighbor pays in secrets."
                        ),
                    }))
                    .collect::<Vec<_>>(),
            })
        }
        other => return Err(ProviderError::unavailable(None, format!("unknown sub-step {other}"))),
    };
    Ok(RawCompletion::structured("demo", body.to_string()).with_model("demo"))
}

/// Scripted provider answering with [`demo_responder`].
pub fn demo_provider(name: impl Into<String>) -> ScriptedProvider {
    ScriptedProvider::new(name).respond_with(demo_responder)
}

fn meta_u64(call: &GenerationCall, key: &str) -> Option<u64> {
    call.metadata.get(key).and_then(JsonValue::as_u64)
}
