//! Process configuration from `DRAFTMILL_*` environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DRAFTMILL_BIND_ADDR` | `0.0.0.0:8080` |
//! | `DRAFTMILL_PERSISTENT_STORE` | `false` |
//! | `DRAFTMILL_DATABASE_URL` (or `DATABASE_URL`) | none, required when persistent |
//! | `DRAFTMILL_PROVIDER_URL` | none (built-in demo provider) |
//! | `DRAFTMILL_PROVIDER_API_KEY` | none |
//! | `DRAFTMILL_QUALITY_MODEL` / `DRAFTMILL_FAST_MODEL` | `quality` / `fast` |
//! | `DRAFTMILL_HEARTBEAT_SECS` | `10` |
//! | `DRAFTMILL_STALL_SECS` | `60` |
//! | `DRAFTMILL_ATTEMPT_TIMEOUTS` | `40,25,15` (seconds) |
//! | `DRAFTMILL_BREAKER_THRESHOLD` | `3` |
//! | `DRAFTMILL_BREAKER_WINDOW_SECS` | `120` |
//! | `DRAFTMILL_ACT_COUNT` / `DRAFTMILL_BEAT_COUNT` / `DRAFTMILL_BEATS_PER_CHUNK` | `3` / `10` / `2` |

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use draftmill_core::DomainError;
use draftmill_pipeline::{EscalatingRetryPolicy, OutlineShape, PipelineConfig};
use draftmill_providers::CircuitBreakerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not valid ({value:?}): {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("pipeline configuration rejected: {0}")]
    Pipeline(#[from] DomainError),
}

/// OpenAI-compatible endpoint serving both tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub quality_model: String,
    pub fast_model: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    /// `Some` when jobs should live in Postgres.
    pub database_url: Option<String>,
    /// `None` runs the built-in deterministic demo provider.
    pub provider: Option<ProviderSettings>,
    pub pipeline: PipelineConfig,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let bind_addr = vars.parse_or("DRAFTMILL_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?;

        let persistent = vars.flag("DRAFTMILL_PERSISTENT_STORE")?;
        let database_url = if persistent {
            let url = vars
                .get("DRAFTMILL_DATABASE_URL")
                .or_else(|| vars.get("DATABASE_URL"))
                .ok_or(ConfigError::Missing("DRAFTMILL_DATABASE_URL"))?;
            Some(url)
        } else {
            None
        };

        let provider = vars.get("DRAFTMILL_PROVIDER_URL").map(|base_url| ProviderSettings {
            base_url,
            api_key: vars.get("DRAFTMILL_PROVIDER_API_KEY"),
            quality_model: vars
                .get("DRAFTMILL_QUALITY_MODEL")
                .unwrap_or_else(|| "quality".to_string()),
            fast_model: vars
                .get("DRAFTMILL_FAST_MODEL")
                .unwrap_or_else(|| "fast".to_string()),
        });

        let defaults = PipelineConfig::default();
        let shape = OutlineShape {
            act_count: vars.parse_or("DRAFTMILL_ACT_COUNT", defaults.shape.act_count)?,
            beat_count: vars.parse_or("DRAFTMILL_BEAT_COUNT", defaults.shape.beat_count)?,
            beats_per_chunk: vars.parse_or("DRAFTMILL_BEATS_PER_CHUNK", defaults.shape.beats_per_chunk)?,
        };

        let retry = match vars.get("DRAFTMILL_ATTEMPT_TIMEOUTS") {
            Some(raw) => {
                let [first, second, third] = parse_timeouts(&raw)?;
                EscalatingRetryPolicy::with_timeouts(first, second, third)?
            }
            None => defaults.retry.clone(),
        };

        let breaker = CircuitBreakerConfig {
            failure_threshold: vars.parse_or(
                "DRAFTMILL_BREAKER_THRESHOLD",
                defaults.breaker.failure_threshold,
            )?,
            window: chrono::Duration::seconds(vars.parse_or(
                "DRAFTMILL_BREAKER_WINDOW_SECS",
                defaults.breaker.window.num_seconds(),
            )?),
        };

        let heartbeat = vars.parse_or(
            "DRAFTMILL_HEARTBEAT_SECS",
            defaults.heartbeat_interval.as_secs(),
        )?;
        let stall = vars.parse_or("DRAFTMILL_STALL_SECS", defaults.stall_threshold.as_secs())?;

        let pipeline = defaults
            .with_shape(shape)
            .with_retry(retry)
            .with_breaker(breaker)
            .with_heartbeat_interval(Duration::from_secs(heartbeat))
            .with_stall_threshold(Duration::from_secs(stall));
        pipeline.validate()?;

        Ok(Self {
            bind_addr,
            database_url,
            provider,
            pipeline,
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var).filter(|v| !v.trim().is_empty())
    }

    fn parse_or<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn flag(&self, var: &'static str) -> Result<bool, ConfigError> {
        match self.get(var).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(ConfigError::Invalid {
                var,
                value: v,
                reason: "expected true/false".into(),
            }),
        }
    }
}

fn parse_timeouts(raw: &str) -> Result<[Duration; 3], ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        var: "DRAFTMILL_ATTEMPT_TIMEOUTS",
        value: raw.to_string(),
        reason,
    };
    let secs = raw
        .split(',')
        .map(|part| part.trim().parse::<u64>().map_err(|e| invalid(e.to_string())))
        .collect::<Result<Vec<_>, _>>()?;
    match secs.as_slice() {
        [a, b, c] => Ok([
            Duration::from_secs(*a),
            Duration::from_secs(*b),
            Duration::from_secs(*c),
        ]),
        other => Err(invalid(format!("expected three values, got {}", other.len()))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Result<Settings, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.bind_addr.port(), 8080);
        assert!(s.database_url.is_none());
        assert!(s.provider.is_none());
        assert_eq!(s.pipeline.shape, OutlineShape::default());
        assert_eq!(s.pipeline.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn persistent_store_requires_a_database_url() {
        let err = settings(&[("DRAFTMILL_PERSISTENT_STORE", "true")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DRAFTMILL_DATABASE_URL")));

        let s = settings(&[
            ("DRAFTMILL_PERSISTENT_STORE", "1"),
            ("DATABASE_URL", "postgres://localhost/draftmill"),
        ])
        .unwrap();
        assert_eq!(s.database_url.as_deref(), Some("postgres://localhost/draftmill"));
    }

    #[test]
    fn provider_settings_pick_up_models() {
        let s = settings(&[
            ("DRAFTMILL_PROVIDER_URL", "https://llm.internal/v1"),
            ("DRAFTMILL_FAST_MODEL", "small"),
        ])
        .unwrap();
        let provider = s.provider.unwrap();
        assert_eq!(provider.quality_model, "quality");
        assert_eq!(provider.fast_model, "small");
        assert_eq!(provider.api_key, None);
    }

    #[test]
    fn timeouts_and_shape_are_applied() {
        let s = settings(&[
            ("DRAFTMILL_ATTEMPT_TIMEOUTS", "60, 30, 10"),
            ("DRAFTMILL_BEAT_COUNT", "12"),
            ("DRAFTMILL_BEATS_PER_CHUNK", "4"),
        ])
        .unwrap();
        let timeouts: Vec<u64> = s
            .pipeline
            .retry
            .steps()
            .iter()
            .map(|p| p.timeout.as_secs())
            .collect();
        assert_eq!(timeouts, vec![60, 30, 10]);
        assert_eq!(s.pipeline.shape.chunks_total(), 3);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = settings(&[("DRAFTMILL_HEARTBEAT_SECS", "soon")]).unwrap_err();
        assert!(err.to_string().contains("DRAFTMILL_HEARTBEAT_SECS"));

        let err = settings(&[("DRAFTMILL_ATTEMPT_TIMEOUTS", "40,25")]).unwrap_err();
        assert!(err.to_string().contains("expected three values"));

        let err = settings(&[("DRAFTMILL_PERSISTENT_STORE", "maybe")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn increasing_timeouts_are_rejected() {
        let err = settings(&[("DRAFTMILL_ATTEMPT_TIMEOUTS", "10,20,30")]).unwrap_err();
        assert!(matches!(err, ConfigError::Pipeline(_)));
    }

    #[test]
    fn too_few_beats_per_act_is_rejected() {
        let err = settings(&[("DRAFTMILL_BEAT_COUNT", "5")]).unwrap_err();
        assert!(matches!(err, ConfigError::Pipeline(_)));
    }

    #[test]
    fn heartbeat_slower_than_stall_is_rejected() {
        let err = settings(&[("DRAFTMILL_HEARTBEAT_SECS", "90")]).unwrap_err();
        assert!(matches!(err, ConfigError::Pipeline(_)));
    }
}
