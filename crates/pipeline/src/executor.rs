//! Single-unit execution: one provider call, classified.
//!
//! The executor never loops. It picks a provider for the attempt's tier,
//! makes exactly one call under a hard timeout, resolves the response and
//! reports success or a classified failure. Whether and when to try again is
//! decided by the orchestrator on a later invocation.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, info, warn};

use draftmill_core::JobId;
use draftmill_providers::{
    CircuitBreaker, ErrorClass, GenerationCall, GenerationProvider, ProviderError, ProviderPool,
    ProviderResponse, ProviderTier, Selection,
};

use crate::plan::{ChunkSpec, OutlineShape, Substep};
use crate::prompt::{PromptBuilder, PromptContext};
use crate::record::Beat;
use crate::retry::{AttemptPlan, EscalatingRetryPolicy};

/// One unit of work: a single sub-step call, or one chunk of a chunked sub-step.
#[derive(Debug, Clone, Copy)]
pub struct WorkUnit<'a> {
    pub job_id: JobId,
    pub substep: Substep,
    pub context: PromptContext<'a>,
    pub chunk: Option<(&'a ChunkSpec, &'a BTreeMap<u32, Beat>)>,
    /// 0-based attempt number of this unit.
    pub attempt: u32,
    /// The previous attempt failed to parse; ask for bare JSON.
    pub strict_format: bool,
}

/// A successful call and where it was served.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitSuccess<T> {
    pub output: T,
    pub provider: String,
    pub tier: ProviderTier,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitFailure {
    /// The call was made and failed.
    Provider {
        error: ProviderError,
        class: ErrorClass,
        provider: String,
        tier: ProviderTier,
    },
    /// Every configured provider is tripped; no call was made.
    NoHealthyProvider,
    /// The retry policy has no plan for this attempt; no call was made.
    Exhausted { attempts: u32 },
}

pub struct ChunkExecutor {
    pool: ProviderPool,
    breaker: Arc<CircuitBreaker>,
    policy: EscalatingRetryPolicy,
    prompts: PromptBuilder,
    shape: OutlineShape,
}

impl ChunkExecutor {
    pub fn new(
        pool: ProviderPool,
        breaker: Arc<CircuitBreaker>,
        policy: EscalatingRetryPolicy,
        shape: OutlineShape,
    ) -> Self {
        Self {
            pool,
            breaker,
            policy,
            prompts: PromptBuilder::new(shape),
            shape,
        }
    }

    pub fn policy(&self) -> &EscalatingRetryPolicy {
        &self.policy
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run an unchunked sub-step.
    pub async fn execute_step(&self, unit: &WorkUnit<'_>) -> Result<UnitSuccess<JsonValue>, UnitFailure> {
        let act_count = self.shape.act_count;
        self.execute_with(unit, |value| match unit.substep {
            Substep::Scaffold => check_act_count(value, act_count),
            _ => Ok(value),
        })
        .await
    }

    /// Run the chunk carried by `unit`.
    pub async fn execute_chunk(&self, unit: &WorkUnit<'_>) -> Result<UnitSuccess<Vec<Beat>>, UnitFailure> {
        self.execute_with(unit, |value| match unit.chunk {
            Some((spec, _)) => normalize_beats(&value, spec),
            None => Err(ProviderError::malformed("chunked sub-step called without a chunk")),
        })
        .await
    }

    async fn execute_with<T, F>(&self, unit: &WorkUnit<'_>, interpret: F) -> Result<UnitSuccess<T>, UnitFailure>
    where
        F: FnOnce(JsonValue) -> Result<T, ProviderError>,
    {
        let Some(plan) = self.policy.plan_for(unit.attempt) else {
            return Err(UnitFailure::Exhausted {
                attempts: unit.attempt,
            });
        };

        let (provider, tier) = match self.pool.select(plan.tier, &self.breaker, Utc::now()) {
            Selection::Preferred(p) => (p, plan.tier),
            Selection::Fallback { provider, tier } => {
                info!(
                    job_id = %unit.job_id,
                    substep = %unit.substep,
                    preferred = %plan.tier,
                    fallback = %tier,
                    "preferred tier unhealthy, falling back"
                );
                (provider, tier)
            }
            Selection::AllUnhealthy => {
                warn!(job_id = %unit.job_id, substep = %unit.substep, "no healthy provider");
                return Err(UnitFailure::NoHealthyProvider);
            }
        };

        let call = self.build_call(unit, &plan, tier);
        let started = std::time::Instant::now();
        let output = self
            .call_once(provider.as_ref(), &call, &plan)
            .await
            .and_then(interpret);

        debug!(
            job_id = %unit.job_id,
            substep = %unit.substep,
            provider = provider.name(),
            tier = %tier,
            attempt = unit.attempt,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = output.is_ok(),
            "provider call finished"
        );

        // Parse failures say nothing about provider health.
        match &output {
            Ok(_) => self.breaker.record_result(provider.name(), Ok(())),
            Err(e) if e.class() != ErrorClass::ParseValidation => {
                self.breaker.record_result(provider.name(), Err(e))
            }
            Err(_) => {}
        }

        match output {
            Ok(output) => Ok(UnitSuccess {
                output,
                provider: provider.name().to_string(),
                tier,
            }),
            Err(error) => Err(UnitFailure::Provider {
                class: error.class(),
                error,
                provider: provider.name().to_string(),
                tier,
            }),
        }
    }

    fn build_call(&self, unit: &WorkUnit<'_>, plan: &AttemptPlan, tier: ProviderTier) -> GenerationCall {
        let prompt = self.prompts.build(
            unit.substep,
            unit.context,
            unit.chunk,
            plan.verbosity,
            unit.strict_format,
        );

        let mut call = GenerationCall::new(
            unit.substep.name(),
            prompt.system,
            prompt.user,
            plan.timeout,
            tier,
        )
        .with_schema(prompt.schema)
        .with_metadata("job_id", json!(unit.job_id.to_string()))
        .with_metadata("attempt", json!(unit.attempt));

        if unit.substep == Substep::Scaffold {
            call = call.with_metadata("act_count", json!(self.shape.act_count));
        }
        if let Some((spec, _)) = unit.chunk {
            call = call
                .with_metadata("chunk", json!(spec.index))
                .with_metadata("chunks_total", json!(spec.total))
                .with_metadata("first_position", json!(spec.first_position))
                .with_metadata("last_position", json!(spec.last_position));
        }
        call
    }

    /// One call, abandoned at the plan's timeout.
    async fn call_once(
        &self,
        provider: &dyn GenerationProvider,
        call: &GenerationCall,
        plan: &AttemptPlan,
    ) -> Result<JsonValue, ProviderError> {
        let raw = match tokio::time::timeout(plan.timeout, provider.call(call)).await {
            Ok(result) => result?,
            Err(_elapsed) => return Err(ProviderError::Timeout(plan.timeout)),
        };
        let response = ProviderResponse::resolve(&raw, call.schema.as_ref());
        if let ProviderResponse::Malformed { reason, .. } = &response {
            debug!(provider = provider.name(), reason = %reason, "malformed provider output");
        }
        response.into_structured()
    }
}

fn check_act_count(value: JsonValue, expected: u32) -> Result<JsonValue, ProviderError> {
    let acts = value
        .get("acts")
        .and_then(JsonValue::as_array)
        .map(Vec::len)
        .unwrap_or(0);
    if acts as u32 != expected {
        return Err(ProviderError::malformed(format!(
            "expected exactly {expected} acts, got {acts}"
        )));
    }
    Ok(value)
}

/// Map returned items onto the chunk's positions.
///
/// An item keeps its own `position` when that lies inside the chunk;
/// otherwise it takes the next unfilled position in order. Every position of
/// the chunk must end up filled.
pub fn normalize_beats(value: &JsonValue, spec: &ChunkSpec) -> Result<Vec<Beat>, ProviderError> {
    let items = value
        .get("beats")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| ProviderError::malformed("missing `beats` list"))?;

    let mut placed: BTreeMap<u32, Beat> = BTreeMap::new();
    let mut unplaced = Vec::new();

    for item in items {
        let title = text_field(item, "title");
        let description = text_field(item, "description");
        if description.is_empty() {
            continue;
        }
        let claimed = item
            .get("position")
            .and_then(JsonValue::as_u64)
            .map(|p| p as u32)
            .filter(|p| spec.contains(*p) && !placed.contains_key(p));
        match claimed {
            Some(position) => {
                placed.insert(
                    position,
                    Beat {
                        position,
                        title,
                        description,
                        degraded: false,
                    },
                );
            }
            None => unplaced.push((title, description)),
        }
    }

    let mut unplaced = unplaced.into_iter();
    for position in spec.positions() {
        if placed.contains_key(&position) {
            continue;
        }
        let Some((title, description)) = unplaced.next() else {
            break;
        };
        placed.insert(
            position,
            Beat {
                position,
                title,
                description,
                degraded: false,
            },
        );
    }

    if placed.len() as u32 != spec.len() {
        return Err(ProviderError::malformed(format!(
            "{} returned {} usable beats, expected {}",
            spec.label(),
            placed.len(),
            spec.len()
        )));
    }

    Ok(placed
        .into_values()
        .map(|mut beat| {
            if beat.title.is_empty() {
                beat.title = format!("Beat {}", beat.position);
            }
            beat
        })
        .collect())
}

fn text_field(item: &JsonValue, key: &str) -> String {
    item.get(key)
        .and_then(JsonValue::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}
