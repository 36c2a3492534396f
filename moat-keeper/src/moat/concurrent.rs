use std::ops::ControlFlow;
use std::sync::Arc;

use moat_limit::ConcurrencyLimiter;
use moat_limit::Reason;
use moat_limit::Registry;
use tracing::info;

use super::ConfigState;
use super::FondConfig;
use super::LifeCycle;
use super::LifeCycleType;
use super::Moat;
use super::MoatMetrics;
use super::MoatType;
use super::Permit;
use crate::config::ConcurrentLimitConfig;
use crate::config::ExternalConfig;
use crate::context::Context;
use crate::resource::ResourceId;

/// Bounds the calls in flight for one resource.
///
/// The limiter is never replaced; a new limit is swapped into it atomically.
#[derive(Debug)]
pub struct ConcurrentMoat {
    resource: ResourceId,
    name: String,
    state: ConfigState<ConcurrentLimitConfig>,
    limiter: Arc<ConcurrencyLimiter>,
    registry: Arc<Registry<ConcurrencyLimiter>>,
}

impl ConcurrentMoat {
    pub fn new(
        resource: ResourceId,
        baseline: Option<ConcurrentLimitConfig>,
        initial: ConcurrentLimitConfig,
        registry: Arc<Registry<ConcurrencyLimiter>>,
    ) -> Self {
        let name = resource.to_string();
        let limiter = registry.get_or_create(&name, || {
            ConcurrencyLimiter::new(&name, initial.max_concurrent_limit)
        });
        limiter.change_threshold(initial.max_concurrent_limit);
        Self {
            resource,
            name,
            state: ConfigState::new(baseline, initial),
            limiter,
            registry,
        }
    }
}

impl LifeCycle for ConcurrentMoat {
    type Config = ConcurrentLimitConfig;

    fn fond(&self, external: &ExternalConfig) -> Option<ConcurrentLimitConfig> {
        external.concurrent_over()
    }

    fn is_config_equals(&self, candidate: &ConcurrentLimitConfig) -> bool {
        self.state.is_current(candidate)
    }

    fn update_with_newest_config(&self, candidate: ConcurrentLimitConfig) {
        info!(
            resource = %self.resource,
            moat = %MoatType::Concurrent,
            max_concurrent_limit = candidate.max_concurrent_limit,
            "applying new config"
        );
        self.limiter
            .change_threshold(candidate.max_concurrent_limit);
        self.state.store(candidate);
    }

    fn update_when_newest_config_is_null(&self) {
        if let Some(baseline) = self.state.reset_target() {
            self.update_with_newest_config(baseline);
        }
    }
}

impl Moat for ConcurrentMoat {
    fn moat_type(&self) -> MoatType {
        MoatType::Concurrent
    }

    fn resource_id(&self) -> &ResourceId {
        &self.resource
    }

    fn try_through(&self, _ctx: &Context) -> ControlFlow<Reason, Permit> {
        self.limiter.acquire_permission()?;
        ControlFlow::Continue(Permit::Concurrent(Arc::clone(&self.limiter)))
    }

    fn exit(&self, _ctx: &Context, permit: Permit) {
        if let Permit::Concurrent(limiter) = permit {
            limiter.release();
        }
    }

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
        FondConfig::Concurrent(*self.state.current())
    }

    fn metrics(&self) -> MoatMetrics {
        MoatMetrics::Concurrent(self.limiter.metrics())
    }

    fn close(&self) {
        self.registry.unregister_instance(&self.name, &self.limiter);
    }
}
