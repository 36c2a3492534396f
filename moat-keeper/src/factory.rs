use std::sync::Arc;
use std::time::Duration;

use moat_limit::ConcurrencyLimiter;
use moat_limit::ErrorCatalog;
use moat_limit::RateLimiter;
use moat_limit::Registry;
use moat_limit::breaker::CircuitBreaker;
use moat_limit::retry::RetryOperations;
use moat_limit::retry::Sleeper;
use quanta::Clock;
use tracing::debug;
use tracing::warn;

use crate::cluster::MoatCluster;
use crate::config::BaselineConfigs;
use crate::config::ConfigSource;
use crate::config::ExternalConfig;
use crate::config::ResourceConfig;
use crate::limit::CreationLimiter;
use crate::limit::creation_key;
use crate::moat::BreakerMoat;
use crate::moat::ConcurrentMoat;
use crate::moat::Moat;
use crate::moat::MoatType;
use crate::moat::RateMoat;
use crate::resource::ResourceId;
use crate::retry::RetryExecutor;

/// The registries algorithm instances are shared through, by resource name.
#[derive(Debug, Clone, Default)]
pub struct Registries {
    pub concurrent: Arc<Registry<ConcurrencyLimiter>>,
    pub rate: Arc<Registry<RateLimiter>>,
    pub breaker: Arc<Registry<CircuitBreaker>>,
    pub retry: Arc<Registry<RetryOperations>>,
}

/// Builds clusters, moats and retry executors from baselines and overrides.
#[derive(Debug)]
pub(crate) struct MoatFactory {
    pub(crate) baselines: BaselineConfigs,
    pub(crate) source: Arc<dyn ConfigSource>,
    pub(crate) catalog: Arc<ErrorCatalog>,
    pub(crate) registries: Registries,
    pub(crate) creation: Arc<CreationLimiter>,
    pub(crate) rate_wait: Duration,
    pub(crate) clock: Clock,
    pub(crate) sleeper: Arc<dyn Sleeper>,
}

impl MoatFactory {
    /// The override of `id`, falling back to the wildcard of its argument.
    pub(crate) fn external_for(&self, id: &ResourceId) -> Option<ExternalConfig> {
        self.source.config(id).or_else(|| {
            id.wildcard()
                .and_then(|wildcard| self.source.config(&wildcard))
        })
    }

    pub(crate) fn create_cluster(&self, id: &ResourceId) -> MoatCluster {
        let baseline = self.baselines.get(id);
        let external = self.external_for(id);
        let cluster = MoatCluster::new(
            id.clone(),
            baseline.and_then(|baseline| baseline.fallback.clone()),
        );
        cluster.refresh_fallback_toggle(external.as_ref());
        for kind in MoatType::ALL {
            if let Some(moat) = self.create_moat(id, kind, external.as_ref()) {
                cluster.add_on_absence(moat);
            }
        }
        if let Some(retry) = self.create_retry(id, external.as_ref()) {
            cluster.set_retry_on_absence(retry);
        }
        debug!(resource = %id, moats = cluster.moats().len(), "cluster created");
        cluster
    }

    /// Builds a moat of `kind` when a baseline or the override asks for one.
    ///
    /// Argument-value moats are refused once their creation cap is reached.
    pub(crate) fn create_moat(
        &self,
        id: &ResourceId,
        kind: MoatType,
        external: Option<&ExternalConfig>,
    ) -> Option<Arc<dyn Moat>> {
        let baseline = self.baselines.get(id);
        let section = |pick: fn(&ResourceConfig) -> bool| baseline.is_some_and(pick);
        let wanted = external.is_some_and(|external| external.names(kind))
            || match kind {
                MoatType::Concurrent => section(|config| config.concurrent.is_some()),
                MoatType::CircuitBreaker => section(|config| config.breaker.is_some()),
                MoatType::Rate => section(|config| config.rate.is_some()),
            };
        if !wanted {
            return None;
        }

        let key = creation_key(id, kind);
        if let Some(key) = &key
            && !self.creation.try_acquire(key)
        {
            return None;
        }

        let built = self.build_moat(id, kind, baseline, external);
        if built.is_none()
            && let Some(key) = &key
        {
            self.creation.release(key);
        }
        built
    }

    fn build_moat(
        &self,
        id: &ResourceId,
        kind: MoatType,
        baseline: Option<&ResourceConfig>,
        external: Option<&ExternalConfig>,
    ) -> Option<Arc<dyn Moat>> {
        let built: Result<Arc<dyn Moat>, moat_limit::ConfigError> = match kind {
            MoatType::Concurrent => {
                let baseline = baseline.and_then(|config| config.concurrent);
                let initial = external
                    .and_then(ExternalConfig::concurrent_over)
                    .or(baseline)?;
                Ok(Arc::new(ConcurrentMoat::new(
                    id.clone(),
                    baseline,
                    initial,
                    Arc::clone(&self.registries.concurrent),
                )))
            }
            MoatType::Rate => {
                let baseline = baseline.and_then(|config| config.rate);
                let initial = external
                    .and_then(|external| external.rate_over(baseline.as_ref()))
                    .or(baseline)?;
                RateMoat::new(
                    id.clone(),
                    baseline,
                    initial,
                    Arc::clone(&self.registries.rate),
                    self.rate_wait,
                    self.clock.clone(),
                )
                .map(|moat| Arc::new(moat) as Arc<dyn Moat>)
            }
            MoatType::CircuitBreaker => {
                let baseline = baseline.and_then(|config| config.breaker.clone());
                let initial = external
                    .and_then(|external| external.breaker_over(baseline.as_ref(), &self.catalog))
                    .or_else(|| baseline.clone())?;
                BreakerMoat::new(
                    id.clone(),
                    baseline,
                    initial,
                    Arc::clone(&self.catalog),
                    Arc::clone(&self.registries.breaker),
                    self.clock.clone(),
                )
                .map(|moat| Arc::new(moat) as Arc<dyn Moat>)
            }
        };
        built
            .inspect_err(|err| warn!(resource = %id, moat = %kind, %err, "moat not created"))
            .ok()
    }

    pub(crate) fn create_retry(
        &self,
        id: &ResourceId,
        external: Option<&ExternalConfig>,
    ) -> Option<Arc<RetryExecutor>> {
        let baseline = self
            .baselines
            .get(id)
            .and_then(|config| config.retry.clone());
        let initial = external
            .and_then(|external| external.retry_over(baseline.as_ref(), &self.catalog))
            .or_else(|| baseline.clone())?;
        RetryExecutor::new(
            id.clone(),
            baseline,
            initial,
            Arc::clone(&self.catalog),
            Arc::clone(&self.registries.retry),
            Arc::clone(&self.sleeper),
        )
        .map(Arc::new)
        .inspect_err(|err| warn!(resource = %id, %err, "retry executor not created"))
        .ok()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use moat_limit::retry::ThreadSleeper;

    use super::*;
    use crate::config::ConcurrentLimitConfig;
    use crate::config::InMemoryConfigSource;
    use crate::config::RateLimitConfig;
    use crate::resource::ArgConfigKey;

    fn factory(
        baselines: HashMap<ResourceId, ResourceConfig>,
        source: Arc<InMemoryConfigSource>,
    ) -> MoatFactory {
        MoatFactory {
            baselines: BaselineConfigs::new(baselines).unwrap(),
            source: source.clone(),
            catalog: Arc::new(ErrorCatalog::new()),
            registries: Registries::default(),
            creation: Arc::new(CreationLimiter::new(source, 100)),
            rate_wait: Duration::ZERO,
            clock: Clock::new(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    #[test]
    fn cluster_follows_baseline_and_override() {
        let id = ResourceId::method("m");
        let source = Arc::new(InMemoryConfigSource::new());
        source.set_config(
            id.clone(),
            ExternalConfig {
                limit_for_period: Some(7),
                ..ExternalConfig::default()
            },
        );
        let factory = factory(
            HashMap::from([(
                id.clone(),
                ResourceConfig::new().with_concurrent(ConcurrentLimitConfig::new(3)),
            )]),
            source,
        );

        let cluster = factory.create_cluster(&id);
        let kinds: Vec<_> = cluster.moats().iter().map(|moat| moat.moat_type()).collect();
        assert_eq!(kinds, vec![MoatType::Concurrent, MoatType::Rate]);

        let rate = cluster.get(MoatType::Rate).unwrap();
        assert_eq!(rate.lifecycle_type(), crate::moat::LifeCycleType::Temporary);
        assert_eq!(
            rate.fond_config(),
            crate::moat::FondConfig::Rate(RateLimitConfig {
                limit_for_period: 7,
                ..RateLimitConfig::default()
            })
        );
        assert!(cluster.retry().is_none());
    }

    #[test]
    fn wildcard_baseline_and_override_apply_to_values() {
        let wildcard = ResourceId::arg_wildcard("m", "user");
        let source = Arc::new(InMemoryConfigSource::new());
        source.set_config(
            wildcard.clone(),
            ExternalConfig {
                max_attempts: Some(2),
                ..ExternalConfig::default()
            },
        );
        let factory = factory(
            HashMap::from([(
                wildcard,
                ResourceConfig::new().with_concurrent(ConcurrentLimitConfig::new(1)),
            )]),
            source,
        );

        let cluster = factory.create_cluster(&ResourceId::arg("m", "user", "42"));
        assert!(cluster.has(MoatType::Concurrent));
        assert_eq!(cluster.retry().unwrap().config().max_attempts, 2);
    }

    #[test]
    fn creation_cap_refuses_extra_values() {
        let wildcard = ResourceId::arg_wildcard("m", "user");
        let source = Arc::new(InMemoryConfigSource::new());
        let key = ArgConfigKey::new("m", "user", MoatType::Concurrent);
        source.set_max_size_limit(key.clone(), Some(1));
        let factory = factory(
            HashMap::from([(
                wildcard,
                ResourceConfig::new().with_concurrent(ConcurrentLimitConfig::new(1)),
            )]),
            source,
        );

        assert!(factory.create_cluster(&ResourceId::arg("m", "user", "1")).has(MoatType::Concurrent));
        assert!(!factory.create_cluster(&ResourceId::arg("m", "user", "2")).has(MoatType::Concurrent));
        assert_eq!(factory.creation.count(&key), 1);
    }
}
