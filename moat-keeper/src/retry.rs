use std::sync::Arc;

use arc_swap::ArcSwap;
use moat_limit::ErrorCatalog;
use moat_limit::Registry;
use moat_limit::retry::RetryConfig;
use moat_limit::retry::RetryMetrics;
use moat_limit::retry::RetryOperations;
use moat_limit::retry::Sleeper;
use tracing::info;
use tracing::warn;

use crate::config::ExternalConfig;
use crate::moat::ConfigState;
use crate::moat::LifeCycle;
use crate::moat::LifeCycleType;
use crate::resource::ResourceId;

/// The retry policy of one resource.
///
/// Reconfiguration swaps in fresh [`RetryOperations`]; an episode already
/// running finishes on the operations it started with.
#[derive(Debug)]
pub struct RetryExecutor {
    resource: ResourceId,
    name: String,
    state: ConfigState<RetryConfig>,
    operations: ArcSwap<RetryOperations>,
    catalog: Arc<ErrorCatalog>,
    registry: Arc<Registry<RetryOperations>>,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryExecutor {
    pub fn new(
        resource: ResourceId,
        baseline: Option<RetryConfig>,
        initial: RetryConfig,
        catalog: Arc<ErrorCatalog>,
        registry: Arc<Registry<RetryOperations>>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Result<Self, moat_limit::ConfigError> {
        let name = resource.to_string();
        let operations = match registry.get(&name) {
            Some(existing) if *existing.config() == initial => existing,
            _ => registry.replace(
                &name,
                RetryOperations::with_sleeper(&name, initial.clone(), Arc::clone(&sleeper))?,
            ),
        };
        Ok(Self {
            resource,
            name,
            state: ConfigState::new(baseline, initial),
            operations: ArcSwap::new(operations),
            catalog,
            registry,
            sleeper,
        })
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource
    }

    /// The operations to run the next episode on.
    pub fn operations(&self) -> Arc<RetryOperations> {
        self.operations.load_full()
    }

    pub fn refresh(&self, external: Option<&ExternalConfig>) {
        crate::moat::refresh(self, external);
    }

    pub fn lifecycle_type(&self) -> LifeCycleType {
        self.state.lifecycle_type()
    }

    pub fn is_deleted(&self) -> bool {
        self.state.is_deleted()
    }

    pub fn config(&self) -> Arc<RetryConfig> {
        self.state.current()
    }

    pub fn metrics(&self) -> RetryMetrics {
        self.operations.load().metrics()
    }

    pub fn close(&self) {
        self.registry
            .unregister_instance(&self.name, &self.operations.load());
    }
}

impl LifeCycle for RetryExecutor {
    type Config = RetryConfig;

    fn fond(&self, external: &ExternalConfig) -> Option<RetryConfig> {
        external.retry_over(self.state.baseline(), &self.catalog)
    }

    fn is_config_equals(&self, candidate: &RetryConfig) -> bool {
        self.state.is_current(candidate)
    }

    fn update_with_newest_config(&self, candidate: RetryConfig) {
        let operations = match RetryOperations::with_sleeper(
            &self.name,
            candidate.clone(),
            Arc::clone(&self.sleeper),
        ) {
            Ok(operations) => operations,
            Err(err) => {
                warn!(resource = %self.resource, %err, "rejected new retry config");
                return;
            }
        };
        info!(
            resource = %self.resource,
            max_attempts = candidate.max_attempts,
            delay = ?candidate.backoff.delay,
            "applying new retry config"
        );
        self.operations
            .store(self.registry.replace(&self.name, operations));
        self.state.store(candidate);
    }

    fn update_when_newest_config_is_null(&self) {
        if let Some(baseline) = self.state.reset_target() {
            self.update_with_newest_config(baseline);
        }
    }
}
