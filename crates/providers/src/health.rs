//! Provider health tracking (circuit breaker).
//!
//! Per provider, the breaker keeps the timestamps of consecutive failures
//! since the last success. A provider is unhealthy while at least
//! `failure_threshold` of those fall inside the trailing window. There is no
//! half-open state: the next natural call is the trial, and a single success
//! clears the streak.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::minutes(2),
        }
    }
}

/// Snapshot of one provider's health, for status endpoints and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealthSnapshot {
    pub provider: String,
    pub healthy: bool,
    pub consecutive_failures_in_window: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct ProviderState {
    failures: VecDeque<DateTime<Utc>>,
    last_error: Option<String>,
}

impl ProviderState {
    fn failures_in_window(&self, now: DateTime<Utc>, window: Duration) -> u32 {
        let cutoff = now - window;
        self.failures.iter().filter(|at| **at > cutoff).count() as u32
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<HashMap<String, ProviderState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn is_healthy(&self, provider: &str) -> bool {
        self.is_healthy_at(provider, Utc::now())
    }

    pub fn is_healthy_at(&self, provider: &str, now: DateTime<Utc>) -> bool {
        let state = self.state.lock().unwrap();
        match state.get(provider) {
            Some(s) => s.failures_in_window(now, self.config.window) < self.config.failure_threshold,
            None => true,
        }
    }

    pub fn record_result(&self, provider: &str, result: Result<(), &ProviderError>) {
        self.record_result_at(provider, result, Utc::now());
    }

    pub fn record_result_at(
        &self,
        provider: &str,
        result: Result<(), &ProviderError>,
        now: DateTime<Utc>,
    ) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(provider.to_string()).or_default();
        match result {
            Ok(()) => {
                if !entry.failures.is_empty() {
                    debug!(provider, "provider recovered; clearing failure streak");
                }
                entry.failures.clear();
                entry.last_error = None;
            }
            Err(err) => {
                entry.failures.push_back(now);
                entry.last_error = Some(err.code().to_string());

                // Entries older than the window can never count again.
                let cutoff = now - self.config.window;
                while entry.failures.front().is_some_and(|at| *at <= cutoff) {
                    entry.failures.pop_front();
                }

                let in_window = entry.failures_in_window(now, self.config.window);
                if in_window == self.config.failure_threshold {
                    warn!(
                        provider,
                        failures = in_window,
                        error_code = err.code(),
                        "provider marked unhealthy"
                    );
                }
            }
        }
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> Vec<ProviderHealthSnapshot> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<_> = state
            .iter()
            .map(|(name, s)| {
                let count = s.failures_in_window(now, self.config.window);
                ProviderHealthSnapshot {
                    provider: name.clone(),
                    healthy: count < self.config.failure_threshold,
                    consecutive_failures_in_window: count,
                    last_error: s.last_error.clone(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.provider.cmp(&b.provider));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn fail(cb: &CircuitBreaker, at: DateTime<Utc>) {
        cb.record_result_at("quality", Err(&ProviderError::EmptyOutput), at);
    }

    #[test]
    fn unknown_provider_is_healthy() {
        let cb = CircuitBreaker::default();
        assert!(cb.is_healthy_at("anything", t0()));
    }

    #[test]
    fn threshold_consecutive_failures_open_the_breaker() {
        let cb = CircuitBreaker::default();
        fail(&cb, t0());
        fail(&cb, t0() + Duration::seconds(10));
        assert!(cb.is_healthy_at("quality", t0() + Duration::seconds(11)));
        fail(&cb, t0() + Duration::seconds(20));
        assert!(!cb.is_healthy_at("quality", t0() + Duration::seconds(21)));
    }

    #[test]
    fn a_success_resets_the_streak() {
        let cb = CircuitBreaker::default();
        for i in 0..3 {
            fail(&cb, t0() + Duration::seconds(i));
        }
        cb.record_result_at("quality", Ok(()), t0() + Duration::seconds(5));
        assert!(cb.is_healthy_at("quality", t0() + Duration::seconds(6)));
        fail(&cb, t0() + Duration::seconds(7));
        assert!(cb.is_healthy_at("quality", t0() + Duration::seconds(8)));
    }

    #[test]
    fn health_recovers_when_window_rolls_past() {
        let cb = CircuitBreaker::default();
        for i in 0..3 {
            fail(&cb, t0() + Duration::seconds(i));
        }
        assert!(!cb.is_healthy_at("quality", t0() + Duration::seconds(30)));
        assert!(cb.is_healthy_at("quality", t0() + Duration::minutes(3)));
    }

    #[test]
    fn providers_are_tracked_independently() {
        let cb = CircuitBreaker::default();
        for i in 0..3 {
            fail(&cb, t0() + Duration::seconds(i));
        }
        assert!(cb.is_healthy_at("fast", t0() + Duration::seconds(4)));
        let snap = cb.snapshot_at(t0() + Duration::seconds(4));
        assert_eq!(snap.len(), 1);
        assert!(!snap[0].healthy);
        assert_eq!(snap[0].last_error.as_deref(), Some("EMPTY_OUTPUT"));
    }
}
