//! Provider call contract.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ProviderError;
use crate::schema::OutputSchema;

/// Provider tier: quality-first or speed/cost-first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderTier {
    Quality,
    Fast,
}

impl ProviderTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderTier::Quality => "quality",
            ProviderTier::Fast => "fast",
        }
    }

    /// The tier used when this one is unhealthy.
    pub fn fallback(&self) -> ProviderTier {
        match self {
            ProviderTier::Quality => ProviderTier::Fast,
            ProviderTier::Fast => ProviderTier::Quality,
        }
    }
}

impl std::fmt::Display for ProviderTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much context a prompt carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptVerbosity {
    /// Full context, detailed instructions.
    Full,
    /// Minimal context, tight instructions.
    Compressed,
}

impl PromptVerbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            PromptVerbosity::Full => "full",
            PromptVerbosity::Compressed => "compressed",
        }
    }
}

impl std::fmt::Display for PromptVerbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outbound generation request.
#[derive(Debug, Clone)]
pub struct GenerationCall {
    /// Sub-step label, for logs and provider-side tracing.
    pub substep: String,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Requested structured output shape, if any.
    pub schema: Option<OutputSchema>,
    pub timeout: Duration,
    pub tier: ProviderTier,
    /// Call metadata (job id, chunk range, attempt). Never sent as prompt text.
    pub metadata: BTreeMap<String, JsonValue>,
}

impl GenerationCall {
    pub fn new(
        substep: impl Into<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
        timeout: Duration,
        tier: ProviderTier,
    ) -> Self {
        Self {
            substep: substep.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            schema: None,
            timeout,
            tier,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// What a provider handed back, before any interpretation.
///
/// Providers fill whichever channel they used; `ProviderResponse::resolve`
/// turns this into a closed variant immediately after the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCompletion {
    /// Free text (message content).
    pub text: Option<String>,
    /// Structured arguments (tool/function call), as a JSON string.
    pub structured_args: Option<String>,
    pub provider: String,
    pub model: String,
}

impl RawCompletion {
    pub fn text(provider: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            provider: provider.into(),
            ..Default::default()
        }
    }

    pub fn structured(provider: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            structured_args: Some(args.into()),
            provider: provider.into(),
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// A generation provider.
///
/// Implementations make exactly one outbound request per `call` and never
/// retry internally; retry and fallback decisions belong to the caller.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    /// Stable provider name (used as the circuit-breaker key).
    fn name(&self) -> &str;

    async fn call(&self, call: &GenerationCall) -> Result<RawCompletion, ProviderError>;
}
