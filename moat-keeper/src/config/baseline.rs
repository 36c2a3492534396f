use std::collections::HashMap;

use moat_limit::breaker::BreakerConfig;
use moat_limit::retry::RetryConfig;

use super::ConcurrentLimitConfig;
use super::ConfigError;
use super::RateLimitConfig;
use crate::fallback::FallbackHandler;
use crate::resource::ResourceId;

/// Fallback attached to a resource.
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    pub handler: FallbackHandler,
    /// Also recover business failures, not only rejections and exhausted retries.
    pub also_apply_to_biz: bool,
}

impl FallbackConfig {
    pub fn new(handler: FallbackHandler) -> Self {
        Self {
            handler,
            also_apply_to_biz: false,
        }
    }

    pub fn also_apply_to_biz(mut self, also_apply_to_biz: bool) -> Self {
        self.also_apply_to_biz = also_apply_to_biz;
        self
    }
}

/// The baseline of one resource. A moat kind with a baseline is permanent.
#[derive(Debug, Clone, Default)]
pub struct ResourceConfig {
    pub concurrent: Option<ConcurrentLimitConfig>,
    pub rate: Option<RateLimitConfig>,
    pub breaker: Option<BreakerConfig>,
    pub retry: Option<RetryConfig>,
    pub fallback: Option<FallbackConfig>,
}

impl ResourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrent(mut self, concurrent: ConcurrentLimitConfig) -> Self {
        self.concurrent = Some(concurrent);
        self
    }

    pub fn with_rate(mut self, rate: RateLimitConfig) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackConfig) -> Self {
        self.fallback = Some(fallback);
        self
    }

    fn validate(&self, resource: &ResourceId) -> Result<(), ConfigError> {
        let invalid = |source| ConfigError::Invalid {
            resource: resource.to_string(),
            source,
        };
        if let Some(rate) = &self.rate {
            rate.validate().map_err(invalid)?;
        }
        if let Some(breaker) = &self.breaker {
            breaker.validate().map_err(invalid)?;
        }
        if let Some(retry) = &self.retry {
            retry.validate().map_err(invalid)?;
        }
        Ok(())
    }
}

/// Baselines of every resource, fixed once the keeper is built.
#[derive(Debug, Clone, Default)]
pub struct BaselineConfigs {
    by_id: HashMap<ResourceId, ResourceConfig>,
}

impl BaselineConfigs {
    pub(crate) fn new(by_id: HashMap<ResourceId, ResourceConfig>) -> Result<Self, ConfigError> {
        for (id, config) in &by_id {
            config.validate(id)?;
        }
        Ok(Self { by_id })
    }

    /// The baseline of `id`, falling back to the wildcard of an argument value.
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceConfig> {
        self.by_id
            .get(id)
            .or_else(|| id.wildcard().and_then(|wildcard| self.by_id.get(&wildcard)))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
