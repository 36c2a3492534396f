use std::ops::ControlFlow;
use std::sync::Arc;

use arc_swap::ArcSwap;
use moat_limit::ErrorCatalog;
use moat_limit::Reason;
use moat_limit::Registry;
use moat_limit::breaker::BreakerConfig;
use moat_limit::breaker::CircuitBreaker;
use moat_limit::breaker::Outcome;
use moat_limit::breaker::PredicateStrategy;
use moat_limit::breaker::predicate_for;
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
use crate::context::Context;
use crate::resource::ResourceId;

#[derive(Debug)]
struct BreakerSlot {
    breaker: Arc<CircuitBreaker>,
    predicate: Arc<dyn PredicateStrategy>,
}

impl BreakerSlot {
    fn new(breaker: Arc<CircuitBreaker>) -> Self {
        let predicate = predicate_for(breaker.config());
        Self { breaker, predicate }
    }
}

/// Trips on a high failure rate and keeps calls away until the resource
/// has had time to recover.
///
/// Any config change but a forced state replaces the breaker, dropping its
/// recorded history.
#[derive(Debug)]
pub struct BreakerMoat {
    resource: ResourceId,
    name: String,
    state: ConfigState<BreakerConfig>,
    slot: ArcSwap<BreakerSlot>,
    catalog: Arc<ErrorCatalog>,
    registry: Arc<Registry<CircuitBreaker>>,
    clock: Clock,
}

impl BreakerMoat {
    pub fn new(
        resource: ResourceId,
        baseline: Option<BreakerConfig>,
        initial: BreakerConfig,
        catalog: Arc<ErrorCatalog>,
        registry: Arc<Registry<CircuitBreaker>>,
        clock: Clock,
    ) -> Result<Self, moat_limit::ConfigError> {
        let name = resource.to_string();
        let breaker = match registry.get(&name) {
            Some(existing) if *existing.config() == initial => existing,
            _ => registry.replace(
                &name,
                CircuitBreaker::with_clock(&name, initial.clone(), clock.clone())?,
            ),
        };
        Ok(Self {
            resource,
            name,
            state: ConfigState::new(baseline, initial),
            slot: ArcSwap::from_pointee(BreakerSlot::new(breaker)),
            catalog,
            registry,
            clock,
        })
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.slot.load().breaker)
    }
}

impl LifeCycle for BreakerMoat {
    type Config = BreakerConfig;

    fn fond(&self, external: &ExternalConfig) -> Option<BreakerConfig> {
        external.breaker_over(self.state.baseline(), &self.catalog)
    }

    fn is_config_equals(&self, candidate: &BreakerConfig) -> bool {
        self.state.is_current(candidate)
    }

    fn update_with_newest_config(&self, candidate: BreakerConfig) {
        let current = self.state.current();
        if current.differs_only_in_forced_state(&candidate) {
            info!(
                resource = %self.resource,
                forced_state = ?candidate.forced_state,
                "applying forced breaker state"
            );
            self.slot.load().breaker.apply_forced_state(candidate.forced_state);
        } else {
            let replacement =
                match CircuitBreaker::with_clock(&self.name, candidate.clone(), self.clock.clone()) {
                    Ok(breaker) => breaker,
                    Err(err) => {
                        warn!(resource = %self.resource, moat = %MoatType::CircuitBreaker, %err, "rejected new config");
                        return;
                    }
                };
            info!(
                resource = %self.resource,
                moat = %MoatType::CircuitBreaker,
                failure_rate_threshold = candidate.failure_rate_threshold,
                ring_buffer_size_in_closed_state = candidate.ring_buffer_size_in_closed_state,
                "applying new config"
            );
            let breaker = self.registry.replace(&self.name, replacement);
            self.slot.store(Arc::new(BreakerSlot::new(breaker)));
        }
        self.state.store(candidate);
    }

    fn update_when_newest_config_is_null(&self) {
        if let Some(baseline) = self.state.reset_target() {
            self.update_with_newest_config(baseline);
        }
    }
}

impl Moat for BreakerMoat {
    fn moat_type(&self) -> MoatType {
        MoatType::CircuitBreaker
    }

    fn resource_id(&self) -> &ResourceId {
        &self.resource
    }

    fn try_through(&self, _ctx: &Context) -> ControlFlow<Reason, Permit> {
        let slot = self.slot.load_full();
        slot.breaker.try_acquire_permission()?;
        ControlFlow::Continue(Permit::CircuitBreaker {
            breaker: Arc::clone(&slot.breaker),
            predicate: Arc::clone(&slot.predicate),
        })
    }

    fn exit(&self, ctx: &Context, permit: Permit) {
        let Permit::CircuitBreaker { breaker, predicate } = permit else {
            return;
        };
        if !ctx.is_executed() {
            breaker.release_permission();
            return;
        }
        let outcome = match ctx.biz_error() {
            Some(err) => Outcome::failure(err.as_ref(), ctx.spend_time()),
            None => Outcome::success(ctx.spend_time()),
        };
        if predicate.is_success(&outcome) {
            breaker.on_success();
        } else {
            breaker.on_failure();
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
        FondConfig::CircuitBreaker((*self.state.current()).clone())
    }

    fn metrics(&self) -> MoatMetrics {
        MoatMetrics::CircuitBreaker(self.slot.load().breaker.metrics())
    }

    fn close(&self) {
        self.registry
            .unregister_instance(&self.name, &self.slot.load().breaker);
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use moat_limit::SharedError;
    use moat_limit::breaker::BreakerState;

    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig::default()
            .with_ring_buffer_size_in_closed_state(2)
            .with_ring_buffer_size_in_half_open_state(1)
            .with_wait_duration_in_open_state(Duration::from_secs(10))
    }

    fn moat(clock: Clock) -> BreakerMoat {
        BreakerMoat::new(
            ResourceId::method("m"),
            Some(config()),
            config(),
            Arc::new(ErrorCatalog::new()),
            Arc::new(Registry::new()),
            clock,
        )
        .unwrap()
    }

    fn run(moat: &BreakerMoat, error: Option<SharedError>) -> bool {
        let mut ctx = Context::new(ResourceId::method("m"));
        let ControlFlow::Continue(permit) = moat.try_through(&ctx) else {
            return false;
        };
        ctx.mark_executed();
        ctx.record(Duration::from_millis(1), error, None);
        moat.exit(&ctx, permit);
        true
    }

    fn failure() -> Option<SharedError> {
        Some(Arc::new(io::Error::other("boom")))
    }

    #[test]
    fn failures_open_the_breaker() {
        let (clock, _mock) = Clock::mock();
        let moat = moat(clock);

        assert!(run(&moat, failure()));
        assert!(run(&moat, failure()));
        assert_eq!(moat.breaker().state(), BreakerState::Open);
        assert!(!run(&moat, None));
    }

    #[test]
    fn unexecuted_exit_returns_the_trial_slot() {
        let (clock, mock) = Clock::mock();
        let moat = moat(clock);
        run(&moat, failure());
        run(&moat, failure());
        mock.increment(Duration::from_secs(10));

        let ctx = Context::new(ResourceId::method("m"));
        let ControlFlow::Continue(permit) = moat.try_through(&ctx) else {
            panic!("half-open must admit a trial call");
        };
        assert!(moat.try_through(&ctx).is_break());
        moat.exit(&ctx, permit);

        assert!(run(&moat, None));
        assert_eq!(moat.breaker().state(), BreakerState::Closed);
    }

    #[test]
    fn forced_state_is_applied_in_place() {
        let (clock, _mock) = Clock::mock();
        let moat = moat(clock);
        let before = moat.breaker();

        moat.refresh(Some(&ExternalConfig {
            forced_open: Some(true),
            ..ExternalConfig::default()
        }));
        assert!(Arc::ptr_eq(&before, &moat.breaker()));
        assert_eq!(before.state(), BreakerState::ForcedOpen);
        assert!(!run(&moat, None));

        moat.refresh(None);
        assert!(Arc::ptr_eq(&before, &moat.breaker()));
        assert_eq!(before.state(), BreakerState::Closed);
        assert_eq!(moat.fond_config(), FondConfig::CircuitBreaker(config()));
    }

    #[test]
    fn other_changes_replace_the_breaker() {
        let (clock, _mock) = Clock::mock();
        let moat = moat(clock);
        let before = moat.breaker();
        run(&moat, failure());

        moat.refresh(Some(&ExternalConfig {
            failure_rate_threshold: Some(80.0),
            ..ExternalConfig::default()
        }));
        let after = moat.breaker();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.metrics().buffered_calls, 0);
        assert_eq!(after.config().failure_rate_threshold, 80.0);
    }

    #[test]
    fn exit_reaches_the_admitting_breaker() {
        let (clock, _mock) = Clock::mock();
        let moat = moat(clock);
        let before = moat.breaker();

        let mut ctx = Context::new(ResourceId::method("m"));
        let ControlFlow::Continue(permit) = moat.try_through(&ctx) else {
            panic!("closed breaker must admit");
        };
        moat.refresh(Some(&ExternalConfig {
            ring_buffer_size_in_closed_state: Some(5),
            ..ExternalConfig::default()
        }));
        ctx.mark_executed();
        ctx.record(Duration::ZERO, failure(), None);
        moat.exit(&ctx, permit);

        assert_eq!(before.metrics().failed_calls, 1);
        assert_eq!(moat.breaker().metrics().buffered_calls, 0);
    }
}
