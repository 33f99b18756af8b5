//! `draftmill-providers`
//!
//! **Responsibility:** the boundary to external generation providers.
//!
//! - One trait, `GenerationProvider`, one outbound call per `call`.
//! - Raw output is resolved into a closed `ProviderResponse` immediately.
//! - Failures are classified (`ProviderError::class`) but never retried here.
//! - Provider health (circuit breaker) and tier fallback live alongside.

pub mod call;
pub mod error;
pub mod health;
pub mod http;
pub mod pool;
pub mod response;
pub mod schema;
pub mod scripted;

pub use call::{GenerationCall, GenerationProvider, PromptVerbosity, ProviderTier, RawCompletion};
pub use error::{ErrorClass, ProviderError};
pub use health::{CircuitBreaker, CircuitBreakerConfig, ProviderHealthSnapshot};
pub use http::{HttpProvider, HttpProviderConfig};
pub use pool::{ProviderPool, Selection};
pub use response::ProviderResponse;
pub use schema::{FieldKind, FieldSpec, OutputSchema};
pub use scripted::{RecordedCall, ScriptedProvider};
