use std::time::Duration;

use moat_limit::ErrorCatalog;
use moat_limit::breaker::BreakerConfig;
use moat_limit::breaker::ForcedState;
use moat_limit::retry::RetryConfig;
use serde::Deserialize;

use super::ConcurrentLimitConfig;
use super::RateLimitConfig;
use crate::moat::MoatType;

/// A dynamic override for one resource. Unset fields leave the baseline alone.
///
/// Deserializes from camelCase keys, with durations written the `humantime`
/// way (`"500ms"`, `"1m 30s"`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct ExternalConfig {
    pub max_concurrent_limit: Option<usize>,

    pub limit_for_period: Option<usize>,
    #[serde(deserialize_with = "humantime_opt")]
    pub limit_refresh_period: Option<Duration>,

    pub failure_rate_threshold: Option<f32>,
    pub ring_buffer_size_in_closed_state: Option<usize>,
    pub ring_buffer_size_in_half_open_state: Option<usize>,
    #[serde(deserialize_with = "humantime_opt")]
    pub wait_duration_in_open_state: Option<Duration>,
    pub ignore_exceptions: Option<Vec<String>>,
    #[serde(deserialize_with = "humantime_opt")]
    pub max_spend_time: Option<Duration>,
    pub forced_open: Option<bool>,
    pub forced_disabled: Option<bool>,

    pub max_attempts: Option<u32>,
    pub include_exceptions: Option<Vec<String>>,
    pub exclude_exceptions: Option<Vec<String>>,
    #[serde(deserialize_with = "humantime_opt")]
    pub delay: Option<Duration>,
    #[serde(deserialize_with = "humantime_opt")]
    pub max_delay: Option<Duration>,
    pub multiplier: Option<f64>,

    pub also_apply_fallback_to_biz_exception: Option<bool>,
}

fn humantime_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|text| humantime::parse_duration(&text).map_err(serde::de::Error::custom))
        .transpose()
}

impl ExternalConfig {
    /// Whether this override says anything about moats of `moat_type`.
    pub fn names(&self, moat_type: MoatType) -> bool {
        match moat_type {
            MoatType::Concurrent => self.max_concurrent_limit.is_some(),
            MoatType::Rate => self.limit_for_period.is_some() || self.limit_refresh_period.is_some(),
            MoatType::CircuitBreaker => {
                self.failure_rate_threshold.is_some()
                    || self.ring_buffer_size_in_closed_state.is_some()
                    || self.ring_buffer_size_in_half_open_state.is_some()
                    || self.wait_duration_in_open_state.is_some()
                    || self.ignore_exceptions.is_some()
                    || self.max_spend_time.is_some()
                    || self.forced_state().is_some()
            }
        }
    }

    pub fn names_retry(&self) -> bool {
        self.max_attempts.is_some()
            || self.include_exceptions.is_some()
            || self.exclude_exceptions.is_some()
            || self.delay.is_some()
            || self.max_delay.is_some()
            || self.multiplier.is_some()
    }

    /// `forcedOpen` wins when both forced flags are set.
    pub fn forced_state(&self) -> Option<ForcedState> {
        if self.forced_open == Some(true) {
            Some(ForcedState::Open)
        } else if self.forced_disabled == Some(true) {
            Some(ForcedState::Disabled)
        } else {
            None
        }
    }

    pub fn concurrent_over(&self) -> Option<ConcurrentLimitConfig> {
        self.max_concurrent_limit.map(ConcurrentLimitConfig::new)
    }

    pub fn rate_over(&self, baseline: Option<&RateLimitConfig>) -> Option<RateLimitConfig> {
        if !self.names(MoatType::Rate) {
            return None;
        }
        let base = baseline.copied().unwrap_or_default();
        Some(RateLimitConfig {
            limit_for_period: self.limit_for_period.unwrap_or(base.limit_for_period),
            limit_refresh_period: self
                .limit_refresh_period
                .unwrap_or(base.limit_refresh_period),
        })
    }

    pub fn breaker_over(
        &self,
        baseline: Option<&BreakerConfig>,
        catalog: &ErrorCatalog,
    ) -> Option<BreakerConfig> {
        if !self.names(MoatType::CircuitBreaker) {
            return None;
        }
        let mut fond = baseline.cloned().unwrap_or_default();
        if let Some(threshold) = self.failure_rate_threshold {
            fond.failure_rate_threshold = threshold;
        }
        if let Some(size) = self.ring_buffer_size_in_closed_state {
            fond.ring_buffer_size_in_closed_state = size;
        }
        if let Some(size) = self.ring_buffer_size_in_half_open_state {
            fond.ring_buffer_size_in_half_open_state = size;
        }
        if let Some(wait) = self.wait_duration_in_open_state {
            fond.wait_duration_in_open_state = wait;
        }
        if let Some(names) = &self.ignore_exceptions {
            fond.ignore_errors = catalog.resolve_all(names);
        }
        if let Some(max) = self.max_spend_time {
            fond.max_spend_time = Some(max);
        }
        if let Some(forced) = self.forced_state() {
            fond.forced_state = Some(forced);
        }
        Some(fond)
    }

    pub fn retry_over(
        &self,
        baseline: Option<&RetryConfig>,
        catalog: &ErrorCatalog,
    ) -> Option<RetryConfig> {
        if !self.names_retry() {
            return None;
        }
        let mut fond = baseline.cloned().unwrap_or_default();
        if let Some(max_attempts) = self.max_attempts {
            fond.max_attempts = max_attempts;
        }
        if let Some(names) = &self.include_exceptions {
            fond.includes = catalog.resolve_all(names);
        }
        if let Some(names) = &self.exclude_exceptions {
            fond.excludes = catalog.resolve_all(names);
        }
        if let Some(delay) = self.delay {
            fond.backoff.delay = delay;
        }
        if let Some(max_delay) = self.max_delay {
            fond.backoff.max_delay = max_delay;
        }
        if let Some(multiplier) = self.multiplier {
            fond.backoff.multiplier = multiplier;
        }
        Some(fond)
    }
}
