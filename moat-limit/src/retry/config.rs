use std::time::Duration;

use crate::ConfigError;
use crate::ErrorSet;

/// How long to wait between attempts.
///
/// The n-th retry waits `delay * multiplier^(n-1)`, capped at `max_delay`
/// when `max_delay` is non-zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }
}

impl BackoffConfig {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn exponential(delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            delay,
            max_delay,
            multiplier,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of invocations, the first one included.
    pub max_attempts: u32,
    pub includes: ErrorSet,
    pub excludes: ErrorSet,
    pub backoff: BackoffConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            includes: ErrorSet::new(),
            excludes: ErrorSet::new(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_includes(mut self, includes: ErrorSet) -> Self {
        self.includes = includes;
        self
    }

    pub fn with_excludes(mut self, excludes: ErrorSet) -> Self {
        self.excludes = excludes;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("max attempts"));
        }
        let multiplier = self.backoff.multiplier;
        if !(multiplier.is_finite() && multiplier >= 1.0) {
            return Err(ConfigError::Multiplier(multiplier));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_multiplier(multiplier: f64) -> RetryConfig {
        RetryConfig::default().with_backoff(BackoffConfig::exponential(
            Duration::from_millis(10),
            multiplier,
            Duration::from_secs(1),
        ))
    }

    #[test]
    fn multiplier_must_be_a_finite_growth_factor() {
        assert!(with_multiplier(1.0).validate().is_ok());
        assert!(with_multiplier(2.5).validate().is_ok());
        assert!(matches!(
            with_multiplier(0.5).validate(),
            Err(ConfigError::Multiplier(_))
        ));
        assert!(matches!(
            with_multiplier(f64::NAN).validate(),
            Err(ConfigError::Multiplier(_))
        ));
        assert!(matches!(
            with_multiplier(f64::INFINITY).validate(),
            Err(ConfigError::Multiplier(_))
        ));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        assert!(matches!(
            RetryConfig::default().with_max_attempts(0).validate(),
            Err(ConfigError::Zero(_))
        ));
    }
}
