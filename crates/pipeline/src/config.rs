//! Pipeline tuning knobs.

use std::time::Duration;

use draftmill_core::{DomainError, DomainResult};
use draftmill_providers::CircuitBreakerConfig;

use crate::plan::OutlineShape;
use crate::qc::QcConfig;
use crate::retry::EscalatingRetryPolicy;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub shape: OutlineShape,
    pub retry: EscalatingRetryPolicy,
    pub qc: QcConfig,
    pub breaker: CircuitBreakerConfig,
    pub heartbeat_interval: Duration,
    /// A generating job whose heartbeat is older than this is presumed dead.
    pub stall_threshold: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            shape: OutlineShape::default(),
            retry: EscalatingRetryPolicy::default(),
            qc: QcConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            heartbeat_interval: Duration::from_secs(10),
            stall_threshold: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    pub fn with_shape(mut self, shape: OutlineShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_retry(mut self, retry: EscalatingRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_qc(mut self, qc: QcConfig) -> Self {
        self.qc = qc;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_stall_threshold(mut self, threshold: Duration) -> Self {
        self.stall_threshold = threshold;
        self
    }

    pub fn validate(&self) -> DomainResult<()> {
        self.shape.validate()?;
        // act_spans gives the smallest act floor(beats / acts) positions.
        let smallest_act = self.shape.beat_count / self.shape.act_count.max(1);
        if smallest_act < self.qc.min_beats_per_act {
            return Err(DomainError::validation(format!(
                "{} beats over {} acts leaves an act with {} beats; QC requires at least {} per act",
                self.shape.beat_count, self.shape.act_count, smallest_act, self.qc.min_beats_per_act
            )));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(DomainError::validation("heartbeat interval must be positive"));
        }
        if self.heartbeat_interval >= self.stall_threshold {
            return Err(DomainError::validation(format!(
                "heartbeat interval ({:?}) must be shorter than the stall threshold ({:?})",
                self.heartbeat_interval, self.stall_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_must_beat_faster_than_stall_detection() {
        let config = PipelineConfig {
            heartbeat_interval: Duration::from_secs(60),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn shape_that_qc_can_never_accept_is_rejected() {
        let config = PipelineConfig::default().with_shape(OutlineShape {
            act_count: 3,
            beat_count: 5,
            beats_per_chunk: 2,
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("act with 1 beats"));

        let config = PipelineConfig::default().with_shape(OutlineShape {
            act_count: 3,
            beat_count: 6,
            beats_per_chunk: 2,
        });
        assert!(config.validate().is_ok());
    }
}
