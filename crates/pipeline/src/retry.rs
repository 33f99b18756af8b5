//! Escalating retry policy.
//!
//! Retries are not loops: each failed attempt is persisted, the invocation
//! returns, and the next invocation asks the policy for the plan of the next
//! attempt. Each step trades quality for a better chance of finishing.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use draftmill_core::{DomainError, DomainResult};
use draftmill_providers::{PromptVerbosity, ProviderTier};

/// How one attempt is executed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptPlan {
    pub tier: ProviderTier,
    pub verbosity: PromptVerbosity,
    pub timeout: Duration,
}

impl AttemptPlan {
    pub const fn new(tier: ProviderTier, verbosity: PromptVerbosity, timeout: Duration) -> Self {
        Self {
            tier,
            verbosity,
            timeout,
        }
    }
}

/// Ordered attempt plans. Attempt `n` (0-based) uses step `n`; past the last
/// step the unit is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalatingRetryPolicy {
    steps: Vec<AttemptPlan>,
}

impl Default for EscalatingRetryPolicy {
    fn default() -> Self {
        Self {
            steps: vec![
                AttemptPlan::new(ProviderTier::Quality, PromptVerbosity::Full, Duration::from_secs(40)),
                AttemptPlan::new(
                    ProviderTier::Quality,
                    PromptVerbosity::Compressed,
                    Duration::from_secs(25),
                ),
                AttemptPlan::new(ProviderTier::Fast, PromptVerbosity::Compressed, Duration::from_secs(15)),
            ],
        }
    }
}

impl EscalatingRetryPolicy {
    /// Custom steps. Timeouts must not grow from one step to the next.
    pub fn new(steps: Vec<AttemptPlan>) -> DomainResult<Self> {
        if steps.is_empty() {
            return Err(DomainError::validation("retry policy needs at least one step"));
        }
        if steps.windows(2).any(|w| w[1].timeout > w[0].timeout) {
            return Err(DomainError::validation(
                "retry policy timeouts must be non-increasing",
            ));
        }
        if steps.iter().any(|s| s.timeout.is_zero()) {
            return Err(DomainError::validation("retry policy timeouts must be positive"));
        }
        Ok(Self { steps })
    }

    /// Default tiers and verbosity with custom timeouts, one per step.
    pub fn with_timeouts(first: Duration, second: Duration, third: Duration) -> DomainResult<Self> {
        let mut steps = Self::default().steps;
        for (step, timeout) in steps.iter_mut().zip([first, second, third]) {
            step.timeout = timeout;
        }
        Self::new(steps)
    }

    /// Plan for the 0-based `attempt`, or `None` once the budget is spent.
    pub fn plan_for(&self, attempt: u32) -> Option<AttemptPlan> {
        self.steps.get(attempt as usize).copied()
    }

    pub fn max_attempts(&self) -> u32 {
        self.steps.len() as u32
    }

    pub fn steps(&self) -> &[AttemptPlan] {
        &self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_escalates_then_downgrades() {
        let policy = EscalatingRetryPolicy::default();

        let first = policy.plan_for(0).unwrap();
        assert_eq!(first.tier, ProviderTier::Quality);
        assert_eq!(first.verbosity, PromptVerbosity::Full);

        let second = policy.plan_for(1).unwrap();
        assert_eq!(second.tier, ProviderTier::Quality);
        assert_eq!(second.verbosity, PromptVerbosity::Compressed);
        assert!(second.timeout < first.timeout);

        let third = policy.plan_for(2).unwrap();
        assert_eq!(third.tier, ProviderTier::Fast);
        assert!(third.timeout < second.timeout);

        assert!(policy.plan_for(3).is_none());
    }

    #[test]
    fn exhaustion_follows_step_count() {
        let policy = EscalatingRetryPolicy::default();
        assert!(policy.plan_for(2).is_some());
        assert!(policy.plan_for(3).is_none());
        assert!(policy.plan_for(4).is_none());
    }

    #[test]
    fn growing_timeouts_are_rejected() {
        let err = EscalatingRetryPolicy::with_timeouts(
            Duration::from_secs(10),
            Duration::from_secs(20),
            Duration::from_secs(5),
        );
        assert!(err.is_err());
        assert!(EscalatingRetryPolicy::new(Vec::new()).is_err());
    }

    #[test]
    fn custom_timeouts_keep_tiers() {
        let policy = EscalatingRetryPolicy::with_timeouts(
            Duration::from_millis(300),
            Duration::from_millis(200),
            Duration::from_millis(100),
        )
        .unwrap();
        assert_eq!(policy.plan_for(2).unwrap().tier, ProviderTier::Fast);
        assert_eq!(policy.plan_for(2).unwrap().timeout, Duration::from_millis(100));
    }

    mod escalation {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn accepted_policies_only_ever_escalate(
                a in 0u64..120,
                b in 0u64..120,
                c in 0u64..120,
                attempt in 0u32..8,
            ) {
                let result = EscalatingRetryPolicy::with_timeouts(
                    Duration::from_secs(a),
                    Duration::from_secs(b),
                    Duration::from_secs(c),
                );
                let valid = a >= b && b >= c && c > 0;
                prop_assert_eq!(result.is_ok(), valid);

                if let Ok(policy) = result {
                    let plans: Vec<AttemptPlan> =
                        (0..policy.max_attempts()).filter_map(|n| policy.plan_for(n)).collect();
                    prop_assert_eq!(plans.len() as u32, policy.max_attempts());

                    for pair in plans.windows(2) {
                        prop_assert!(pair[1].timeout <= pair[0].timeout);
                        // Compressed prompts and the fast tier are never walked back.
                        prop_assert!(
                            pair[0].verbosity != PromptVerbosity::Compressed
                                || pair[1].verbosity == PromptVerbosity::Compressed
                        );
                        prop_assert!(
                            pair[0].tier != ProviderTier::Fast || pair[1].tier == ProviderTier::Fast
                        );
                    }
                    prop_assert_eq!(policy.plan_for(attempt).is_some(), attempt < policy.max_attempts());
                }
            }
        }
    }
}
