//! Providers grouped by tier, with health-gated selection.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::call::{GenerationProvider, ProviderTier};
use crate::health::CircuitBreaker;

/// Result of asking the pool for a provider.
pub enum Selection {
    /// The requested tier is healthy.
    Preferred(Arc<dyn GenerationProvider>),
    /// The requested tier is unhealthy; this is the other tier.
    Fallback {
        provider: Arc<dyn GenerationProvider>,
        tier: ProviderTier,
    },
    /// No configured provider is healthy.
    AllUnhealthy,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selection::Preferred(p) => f.debug_tuple("Preferred").field(&p.name()).finish(),
            Selection::Fallback { provider, tier } => f
                .debug_struct("Fallback")
                .field("provider", &provider.name())
                .field("tier", tier)
                .finish(),
            Selection::AllUnhealthy => f.write_str("AllUnhealthy"),
        }
    }
}

#[derive(Clone, Default)]
pub struct ProviderPool {
    tiers: BTreeMap<ProviderTier, Arc<dyn GenerationProvider>>,
}

impl ProviderPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, tier: ProviderTier, provider: Arc<dyn GenerationProvider>) -> Self {
        self.tiers.insert(tier, provider);
        self
    }

    pub fn get(&self, tier: ProviderTier) -> Option<&Arc<dyn GenerationProvider>> {
        self.tiers.get(&tier)
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    /// Pick a provider for `preferred`, skipping an unhealthy one.
    ///
    /// A missing tier is treated like an unhealthy one.
    pub fn select(&self, preferred: ProviderTier, breaker: &CircuitBreaker, now: DateTime<Utc>) -> Selection {
        if let Some(p) = self.tiers.get(&preferred) {
            if breaker.is_healthy_at(p.name(), now) {
                return Selection::Preferred(p.clone());
            }
        }
        let other = preferred.fallback();
        if let Some(p) = self.tiers.get(&other) {
            if breaker.is_healthy_at(p.name(), now) {
                return Selection::Fallback {
                    provider: p.clone(),
                    tier: other,
                };
            }
        }
        Selection::AllUnhealthy
    }
}

impl std::fmt::Debug for ProviderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.tiers.iter().map(|(t, p)| (t, p.name())))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::scripted::ScriptedProvider;

    fn pool() -> ProviderPool {
        ProviderPool::new()
            .with_provider(ProviderTier::Quality, Arc::new(ScriptedProvider::new("big")))
            .with_provider(ProviderTier::Fast, Arc::new(ScriptedProvider::new("small")))
    }

    fn trip(breaker: &CircuitBreaker, name: &str, now: DateTime<Utc>) {
        for _ in 0..breaker.config().failure_threshold {
            breaker.record_result_at(name, Err(&ProviderError::EmptyOutput), now);
        }
    }

    #[test]
    fn healthy_preferred_tier_is_used() {
        let breaker = CircuitBreaker::default();
        match pool().select(ProviderTier::Quality, &breaker, Utc::now()) {
            Selection::Preferred(p) => assert_eq!(p.name(), "big"),
            other => panic!("unexpected selection: {other:?}"),
        }
    }

    #[test]
    fn unhealthy_preferred_tier_falls_back() {
        let breaker = CircuitBreaker::default();
        let now = Utc::now();
        trip(&breaker, "big", now);
        match pool().select(ProviderTier::Quality, &breaker, now) {
            Selection::Fallback { provider, tier } => {
                assert_eq!(provider.name(), "small");
                assert_eq!(tier, ProviderTier::Fast);
            }
            other => panic!("unexpected selection: {other:?}"),
        }
    }

    #[test]
    fn all_unhealthy_is_reported() {
        let breaker = CircuitBreaker::default();
        let now = Utc::now();
        trip(&breaker, "big", now);
        trip(&breaker, "small", now);
        assert!(matches!(
            pool().select(ProviderTier::Fast, &breaker, now),
            Selection::AllUnhealthy
        ));
    }
}
