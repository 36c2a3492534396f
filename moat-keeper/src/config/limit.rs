use std::time::Duration;

use moat_limit::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrentLimitConfig {
    pub max_concurrent_limit: usize,
}

impl ConcurrentLimitConfig {
    pub fn new(max_concurrent_limit: usize) -> Self {
        Self {
            max_concurrent_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub limit_for_period: usize,
    pub limit_refresh_period: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit_for_period: 50,
            limit_refresh_period: Duration::from_secs(1),
        }
    }
}

impl RateLimitConfig {
    pub fn new(limit_for_period: usize, limit_refresh_period: Duration) -> Self {
        Self {
            limit_for_period,
            limit_refresh_period,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit_refresh_period.is_zero() {
            return Err(ConfigError::Zero("limit refresh period"));
        }
        Ok(())
    }
}
