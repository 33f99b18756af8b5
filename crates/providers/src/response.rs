//! Closed interpretation of a provider's raw output.

use serde_json::Value as JsonValue;

use crate::call::RawCompletion;
use crate::error::ProviderError;
use crate::schema::OutputSchema;

/// A provider response, resolved right after the call.
///
/// Downstream code dispatches on these variants only; it never inspects the
/// raw completion for optional channels.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResponse {
    /// Nothing parseable came back.
    Empty,
    /// Output was present but did not parse or did not match the schema.
    Malformed { raw: String, reason: String },
    /// Schema-checked structured output.
    Structured(JsonValue),
    /// Plain text, no schema was requested.
    Freeform(String),
}

impl ProviderResponse {
    /// Resolve a raw completion against the requested schema.
    ///
    /// Structured arguments win over text when both are present. When a schema
    /// was requested and only text came back, a JSON object embedded in the
    /// text (optionally fenced) is accepted.
    pub fn resolve(raw: &RawCompletion, schema: Option<&OutputSchema>) -> Self {
        if let Some(args) = raw.structured_args.as_deref().filter(|a| !a.trim().is_empty()) {
            return match serde_json::from_str::<JsonValue>(args) {
                Ok(value) => check(value, args, schema),
                Err(e) => ProviderResponse::Malformed {
                    raw: args.to_string(),
                    reason: format!("structured arguments are not JSON: {e}"),
                },
            };
        }

        let text = match raw.text.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => return ProviderResponse::Empty,
        };

        let Some(schema) = schema else {
            return ProviderResponse::Freeform(text.to_string());
        };

        match extract_json_object(text) {
            Some(candidate) => match serde_json::from_str::<JsonValue>(candidate) {
                Ok(value) => check(value, text, Some(schema)),
                Err(e) => ProviderResponse::Malformed {
                    raw: text.to_string(),
                    reason: format!("embedded JSON does not parse: {e}"),
                },
            },
            None => ProviderResponse::Malformed {
                raw: text.to_string(),
                reason: format!("expected a `{}` JSON object, got free text", schema.name),
            },
        }
    }

    /// The structured value, or the matching provider error.
    pub fn into_structured(self) -> Result<JsonValue, ProviderError> {
        match self {
            ProviderResponse::Structured(v) => Ok(v),
            ProviderResponse::Empty => Err(ProviderError::EmptyOutput),
            ProviderResponse::Malformed { reason, .. } => Err(ProviderError::MalformedOutput(reason)),
            ProviderResponse::Freeform(_) => Err(ProviderError::malformed(
                "expected structured output, got free text",
            )),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProviderResponse::Empty => "empty",
            ProviderResponse::Malformed { .. } => "malformed",
            ProviderResponse::Structured(_) => "structured",
            ProviderResponse::Freeform(_) => "freeform",
        }
    }
}

fn check(value: JsonValue, raw: &str, schema: Option<&OutputSchema>) -> ProviderResponse {
    match schema.map(|s| s.check(&value)) {
        Some(Err(reason)) => ProviderResponse::Malformed {
            raw: raw.to_string(),
            reason,
        },
        _ => ProviderResponse::Structured(value),
    }
}

/// Locate the outermost `{ ... }` span, skipping markdown fences.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}
