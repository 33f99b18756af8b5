//! Provider failure taxonomy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification used by retry decisions.
///
/// - `TransientProvider`: retryable with the escalating policy.
/// - `FatalProvider`: never retried, terminal for the job.
/// - `ParseValidation`: retried with a stricter output-format instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    TransientProvider,
    FatalProvider,
    ParseValidation,
}

impl ErrorClass {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorClass::FatalProvider)
    }
}

/// A single provider call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    #[error("provider unavailable: {message}")]
    Unavailable { status: Option<u16>, message: String },

    #[error("provider requires payment: {0}")]
    PaymentRequired(String),

    #[error("provider call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("provider returned no usable output")]
    EmptyOutput,

    #[error("provider output is malformed: {0}")]
    MalformedOutput(String),
}

impl ProviderError {
    pub fn unavailable(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            status,
            message: message.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedOutput(reason.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::RateLimited { .. }
            | ProviderError::Unavailable { .. }
            | ProviderError::Timeout(_)
            | ProviderError::EmptyOutput => ErrorClass::TransientProvider,
            ProviderError::PaymentRequired(_) => ErrorClass::FatalProvider,
            ProviderError::MalformedOutput(_) => ErrorClass::ParseValidation,
        }
    }

    /// Stable code persisted on the job record.
    pub fn code(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "RATE_LIMITED",
            ProviderError::Unavailable { .. } => "PROVIDER_UNAVAILABLE",
            ProviderError::PaymentRequired(_) => "PAYMENT_REQUIRED",
            ProviderError::Timeout(_) => "PROVIDER_TIMEOUT",
            ProviderError::EmptyOutput => "EMPTY_OUTPUT",
            ProviderError::MalformedOutput(_) => "MALFORMED_OUTPUT",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_output_is_transient_not_parse() {
        assert_eq!(ProviderError::EmptyOutput.class(), ErrorClass::TransientProvider);
        assert_eq!(
            ProviderError::malformed("bad json").class(),
            ErrorClass::ParseValidation
        );
    }

    #[test]
    fn payment_required_is_the_only_fatal_kind() {
        let all = [
            ProviderError::RateLimited { retry_after: None },
            ProviderError::unavailable(Some(503), "down"),
            ProviderError::PaymentRequired("quota".into()),
            ProviderError::Timeout(Duration::from_secs(5)),
            ProviderError::EmptyOutput,
            ProviderError::malformed("x"),
        ];
        let fatal: Vec<_> = all
            .iter()
            .filter(|e| !e.class().is_retryable())
            .map(|e| e.code())
            .collect();
        assert_eq!(fatal, vec!["PAYMENT_REQUIRED"]);
    }
}
