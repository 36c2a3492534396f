use std::time::Duration;

use crate::ConfigError;
use crate::ErrorSet;

/// An operator-imposed breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForcedState {
    Open,
    Disabled,
}

/// Parameters of a [`CircuitBreaker`](super::CircuitBreaker).
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    pub ring_buffer_size_in_closed_state: usize,
    pub ring_buffer_size_in_half_open_state: usize,
    /// Failure percentage in `(0, 100]` at which the breaker opens.
    pub failure_rate_threshold: f32,
    pub wait_duration_in_open_state: Duration,
    /// Errors counted as successes.
    pub ignore_errors: ErrorSet,
    /// Calls slower than this count as failures.
    pub max_spend_time: Option<Duration>,
    pub forced_state: Option<ForcedState>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            ring_buffer_size_in_closed_state: 100,
            ring_buffer_size_in_half_open_state: 10,
            failure_rate_threshold: 50.0,
            wait_duration_in_open_state: Duration::from_secs(60),
            ignore_errors: ErrorSet::new(),
            max_spend_time: None,
            forced_state: None,
        }
    }
}

impl BreakerConfig {
    pub fn with_ring_buffer_size_in_closed_state(mut self, size: usize) -> Self {
        self.ring_buffer_size_in_closed_state = size;
        self
    }

    pub fn with_ring_buffer_size_in_half_open_state(mut self, size: usize) -> Self {
        self.ring_buffer_size_in_half_open_state = size;
        self
    }

    pub fn with_failure_rate_threshold(mut self, threshold: f32) -> Self {
        self.failure_rate_threshold = threshold;
        self
    }

    pub fn with_wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.wait_duration_in_open_state = wait;
        self
    }

    pub fn with_ignore_errors(mut self, ignore: ErrorSet) -> Self {
        self.ignore_errors = ignore;
        self
    }

    pub fn with_max_spend_time(mut self, max: Duration) -> Self {
        self.max_spend_time = Some(max);
        self
    }

    pub fn with_forced_state(mut self, forced: Option<ForcedState>) -> Self {
        self.forced_state = forced;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.failure_rate_threshold > 0.0 && self.failure_rate_threshold <= 100.0) {
            return Err(ConfigError::FailureRateThreshold(
                self.failure_rate_threshold,
            ));
        }
        if self.ring_buffer_size_in_closed_state == 0 {
            return Err(ConfigError::Zero("ring buffer size in closed state"));
        }
        if self.ring_buffer_size_in_half_open_state == 0 {
            return Err(ConfigError::Zero("ring buffer size in half-open state"));
        }
        Ok(())
    }

    /// Equal in everything but the forced state.
    ///
    /// Configs differing only here can be applied to a live breaker in place.
    pub fn differs_only_in_forced_state(&self, other: &Self) -> bool {
        self.forced_state != other.forced_state
            && Self {
                forced_state: None,
                ..self.clone()
            } == Self {
                forced_state: None,
                ..other.clone()
            }
    }
}
