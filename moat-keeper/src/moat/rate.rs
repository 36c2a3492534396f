use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use moat_limit::RateLimiter;
use moat_limit::Reason;
use moat_limit::Registry;
use quanta::Clock;
use tracing::info;
use tracing::warn;

use super::ConfigState;
use super::FondConfig;
use super::LifeCycle;
use super::LifeCycleType;
use super::Moat;
use super::MoatMetrics;
use super::MoatType;
use super::Permit;
use crate::config::ExternalConfig;
use crate::config::RateLimitConfig;
use crate::context::Context;
use crate::resource::ResourceId;

/// Limits calls per period for one resource.
///
/// A new limit is applied in place and takes effect at the next window. A
/// new period swaps in a fresh limiter.
#[derive(Debug)]
pub struct RateMoat {
    resource: ResourceId,
    name: String,
    state: ConfigState<RateLimitConfig>,
    limiter: ArcSwap<RateLimiter>,
    registry: Arc<Registry<RateLimiter>>,
    /// How long an admission may block waiting for the next window.
    wait: Duration,
    clock: Clock,
}

impl RateMoat {
    pub fn new(
        resource: ResourceId,
        baseline: Option<RateLimitConfig>,
        initial: RateLimitConfig,
        registry: Arc<Registry<RateLimiter>>,
        wait: Duration,
        clock: Clock,
    ) -> Result<Self, moat_limit::ConfigError> {
        let name = resource.to_string();
        let limiter = match registry.get(&name) {
            Some(existing) if existing.period() == initial.limit_refresh_period => {
                existing.change_limit_for_period(initial.limit_for_period);
                existing
            }
            _ => registry.replace(
                &name,
                RateLimiter::with_clock(
                    &name,
                    initial.limit_for_period,
                    initial.limit_refresh_period,
                    clock.clone(),
                )?,
            ),
        };
        Ok(Self {
            resource,
            name,
            state: ConfigState::new(baseline, initial),
            limiter: ArcSwap::new(limiter),
            registry,
            wait,
            clock,
        })
    }
}

impl LifeCycle for RateMoat {
    type Config = RateLimitConfig;

    fn fond(&self, external: &ExternalConfig) -> Option<RateLimitConfig> {
        external.rate_over(self.state.baseline())
    }

    fn is_config_equals(&self, candidate: &RateLimitConfig) -> bool {
        self.state.is_current(candidate)
    }

    fn update_with_newest_config(&self, candidate: RateLimitConfig) {
        let current = self.limiter.load_full();
        if current.period() == candidate.limit_refresh_period {
            current.change_limit_for_period(candidate.limit_for_period);
        } else {
            let replacement = match RateLimiter::with_clock(
                &self.name,
                candidate.limit_for_period,
                candidate.limit_refresh_period,
                self.clock.clone(),
            ) {
                Ok(limiter) => limiter,
                Err(err) => {
                    warn!(resource = %self.resource, moat = %MoatType::Rate, %err, "rejected new config");
                    return;
                }
            };
            self.limiter
                .store(self.registry.replace(&self.name, replacement));
        }
        info!(
            resource = %self.resource,
            moat = %MoatType::Rate,
            limit_for_period = candidate.limit_for_period,
            limit_refresh_period = ?candidate.limit_refresh_period,
            "applying new config"
        );
        self.state.store(candidate);
    }

    fn update_when_newest_config_is_null(&self) {
        if let Some(baseline) = self.state.reset_target() {
            self.update_with_newest_config(baseline);
        }
    }
}

impl Moat for RateMoat {
    fn moat_type(&self) -> MoatType {
        MoatType::Rate
    }

    fn resource_id(&self) -> &ResourceId {
        &self.resource
    }

    fn try_through(&self, ctx: &Context) -> ControlFlow<Reason, Permit> {
        let timeout = if ctx.may_block() {
            self.wait
        } else {
            Duration::ZERO
        };
        self.limiter.load().acquire_permission(timeout)?;
        ControlFlow::Continue(Permit::Rate)
    }

    fn exit(&self, _ctx: &Context, _permit: Permit) {}

    fn refresh(&self, external: Option<&ExternalConfig>) {
        super::refresh(self, external);
    }

    fn lifecycle_type(&self) -> LifeCycleType {
        self.state.lifecycle_type()
    }

    fn is_deleted(&self) -> bool {
        self.state.is_deleted()
    }

    fn fond_config(&self) -> FondConfig {
        FondConfig::Rate(*self.state.current())
    }

    fn metrics(&self) -> MoatMetrics {
        MoatMetrics::Rate(self.limiter.load().metrics())
    }

    fn close(&self) {
        self.registry
            .unregister_instance(&self.name, &self.limiter.load_full());
    }
}
