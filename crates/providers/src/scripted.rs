//! Scripted provider for tests and local development.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::call::{GenerationCall, GenerationProvider, ProviderTier, RawCompletion};
use crate::error::ProviderError;

pub type Responder =
    Arc<dyn Fn(&GenerationCall) -> Result<RawCompletion, ProviderError> + Send + Sync>;

/// What a scripted provider saw on one call.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub substep: String,
    pub tier: ProviderTier,
    pub timeout: Duration,
    pub user_prompt: String,
    pub system_prompt: String,
    pub metadata: std::collections::BTreeMap<String, JsonValue>,
}

/// Provider whose answers are queued up front or computed by a responder.
///
/// Queued outcomes are consumed first, in order. When the queue is empty the
/// responder answers; without one the call yields `EmptyOutput`.
pub struct ScriptedProvider {
    name: String,
    queue: Mutex<VecDeque<Result<RawCompletion, ProviderError>>>,
    responder: Option<Responder>,
    latency: Option<Duration>,
    history: Mutex<Vec<RecordedCall>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            latency: None,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn respond_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&GenerationCall) -> Result<RawCompletion, ProviderError> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(f));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn push(&self, outcome: Result<RawCompletion, ProviderError>) {
        self.queue.lock().unwrap().push_back(outcome);
    }

    pub fn push_failure(&self, err: ProviderError) {
        self.push(Err(err));
    }

    pub fn calls(&self) -> usize {
        self.history.lock().unwrap().len()
    }

    pub fn history(&self) -> Vec<RecordedCall> {
        self.history.lock().unwrap().clone()
    }
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("name", &self.name)
            .field("queued", &self.queue.lock().unwrap().len())
            .field("calls", &self.calls())
            .finish()
    }
}

#[async_trait]
impl GenerationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, call: &GenerationCall) -> Result<RawCompletion, ProviderError> {
        self.history.lock().unwrap().push(RecordedCall {
            substep: call.substep.clone(),
            tier: call.tier,
            timeout: call.timeout,
            user_prompt: call.user_prompt.clone(),
            system_prompt: call.system_prompt.clone(),
            metadata: call.metadata.clone(),
        });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let queued = self.queue.lock().unwrap().pop_front();
        match queued {
            Some(outcome) => outcome,
            None => match &self.responder {
                Some(responder) => responder(call),
                None => Err(ProviderError::EmptyOutput),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> GenerationCall {
        GenerationCall::new(
            "summary",
            "sys",
            "user",
            Duration::from_secs(5),
            ProviderTier::Quality,
        )
    }

    #[tokio::test]
    async fn queue_is_consumed_before_responder() {
        let provider = ScriptedProvider::new("p")
            .respond_with(|_| Ok(RawCompletion::text("p", "from responder")));
        provider.push_failure(ProviderError::RateLimited { retry_after: None });

        assert!(matches!(
            provider.call(&call()).await,
            Err(ProviderError::RateLimited { .. })
        ));
        let second = provider.call(&call()).await.unwrap();
        assert_eq!(second.text.as_deref(), Some("from responder"));
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn no_script_yields_empty_output() {
        let provider = ScriptedProvider::new("p");
        assert_eq!(provider.call(&call()).await, Err(ProviderError::EmptyOutput));
        assert_eq!(provider.history()[0].substep, "summary");
    }
}
