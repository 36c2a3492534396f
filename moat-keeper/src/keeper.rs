use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use moat_limit::BoxError;
use moat_limit::ErrorCatalog;
use moat_limit::retry::RetryContext;
use moat_limit::retry::Sleeper;
use moat_limit::retry::ThreadSleeper;
use quanta::Clock;
use tracing::info;

use crate::cache::MoatClusterCache;
use crate::cache::RemovalCause;
use crate::chain;
use crate::cluster::MoatCluster;
use crate::config::BaselineConfigs;
use crate::config::ConfigError;
use crate::config::ConfigSource;
use crate::config::InMemoryConfigSource;
use crate::config::ResourceConfig;
use crate::context::Context;
use crate::error::MoatError;
use crate::factory::MoatFactory;
use crate::factory::Registries;
use crate::fallback;
use crate::handle::Handle;
use crate::limit;
use crate::limit::CreationLimiter;
use crate::metrics::ClusterMetrics;
use crate::metrics::Instruments;
use crate::moat::FondConfig;
use crate::moat::MoatType;
use crate::resource::ArgConfigKey;
use crate::resource::ResourceId;

/// Tuning knobs of a [`MoatKeeper`].
#[derive(Debug, Clone, Copy)]
pub struct KeeperOptions {
    /// Clusters kept before the least recently used one is evicted.
    pub cache_capacity: usize,
    /// Clusters idle for this long are evicted.
    pub idle_expiry: Duration,
    /// Creation cap of per-argument moats without a configured one.
    pub default_max_size_limit: usize,
    /// How long admission may wait for the next rate window.
    ///
    /// [`MoatKeeper::execute`] blocks the thread for it and
    /// [`MoatKeeper::execute_async`] sleeps on the tokio timer. The tower
    /// layer never waits.
    pub rate_limit_wait: Duration,
}

impl Default for KeeperOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 5000,
            idle_expiry: Duration::from_secs(60 * 60),
            default_max_size_limit: 100,
            rate_limit_wait: Duration::ZERO,
        }
    }
}

impl KeeperOptions {
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn with_idle_expiry(mut self, idle_expiry: Duration) -> Self {
        self.idle_expiry = idle_expiry;
        self
    }

    pub fn with_default_max_size_limit(mut self, limit: usize) -> Self {
        self.default_max_size_limit = limit;
        self
    }

    pub fn with_rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait = wait;
        self
    }
}

#[derive(Debug)]
pub(crate) struct KeeperInner {
    pub(crate) factory: MoatFactory,
    pub(crate) cache: MoatClusterCache,
    /// Method name to the group sharing its moats.
    groups: HashMap<String, String>,
    default_max_size_limit: usize,
    instruments: Instruments,
}

impl KeeperInner {
    fn on_cap_change(&self, key: &ArgConfigKey, old: Option<usize>, new: Option<usize>) {
        let cap = new.unwrap_or(self.default_max_size_limit);
        info!(%key, ?old, ?new, "creation cap changed");
        limit::shrink(&self.cache, &self.factory.creation, key, cap);
    }
}

/// Entry point: protects calls to resources with their moats, retry policy
/// and fallback.
///
/// Cheap to clone; clones share every cluster.
#[derive(Debug, Clone)]
pub struct MoatKeeper {
    pub(crate) inner: Arc<KeeperInner>,
}

impl MoatKeeper {
    pub fn builder() -> MoatKeeperBuilder {
        MoatKeeperBuilder::default()
    }

    /// The resource whose cluster guards `id`: its group, if it has one.
    fn cluster_id(&self, id: &ResourceId) -> ResourceId {
        match id {
            ResourceId::Method(method) => match self.inner.groups.get(method) {
                Some(group) => ResourceId::Group(group.clone()),
                None => id.clone(),
            },
            _ => id.clone(),
        }
    }

    fn cluster(&self, id: &ResourceId) -> Arc<MoatCluster> {
        let id = self.cluster_id(id);
        self.inner
            .cache
            .get_or_insert_with(&id, || self.inner.factory.create_cluster(&id))
    }

    /// Asks every moat of the context's resource for admission.
    ///
    /// The caller runs the protected work only if the handle is allowed, and
    /// must end it afterwards.
    pub fn try_to_execute(&self, ctx: Context) -> Handle {
        let cluster = self.cluster(ctx.resource_id());
        chain::try_to_execute(
            cluster,
            ctx,
            &self.inner.factory.clock,
            &self.inner.instruments,
        )
    }

    /// Runs `op` under the moats of the context's resource, with retry and
    /// fallback.
    ///
    /// Admission happens once; retries repeat only `op`.
    ///
    /// # Errors
    ///
    /// The rejection, the exhausted retry or the business error, unless a
    /// fallback recovered it.
    pub fn execute<T, F>(&self, ctx: Context, mut op: F) -> Result<T, MoatError>
    where
        T: 'static,
        F: FnMut() -> Result<T, BoxError>,
    {
        let cluster = self.cluster(ctx.resource_id());
        let resource = ctx.resource_id().clone();
        let handle = chain::try_to_execute(
            Arc::clone(&cluster),
            ctx,
            &self.inner.factory.clock,
            &self.inner.instruments,
        );
        if !handle.is_allowed() {
            return handle.into_rejection();
        }

        let outcome = match cluster.retry() {
            None => op().map_err(|err| MoatError::Biz(Arc::from(err))),
            Some(retry) => {
                let mut attempts = 0;
                let result = retry.operations().execute(|_| {
                    attempts += 1;
                    op()
                });
                self.inner.instruments.retry_attempts(&resource, attempts);
                result.map_err(|err| MoatError::from_retry(&resource, err))
            }
        };
        finish(handle, outcome)
    }

    /// The async counterpart of [`execute`](Self::execute). Rate waits and
    /// backoff waits sleep on the tokio timer instead of blocking the thread.
    ///
    /// # Errors
    ///
    /// As [`execute`](Self::execute).
    pub async fn execute_async<T, F, Fut>(&self, ctx: Context, mut op: F) -> Result<T, MoatError>
    where
        T: 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let cluster = self.cluster(ctx.resource_id());
        let resource = ctx.resource_id().clone();
        let handle = chain::try_to_execute_async(
            Arc::clone(&cluster),
            ctx,
            self.inner.factory.rate_wait,
            &self.inner.factory.clock,
            &self.inner.instruments,
        )
        .await;
        if !handle.is_allowed() {
            return handle.into_rejection();
        }

        let outcome = match cluster.retry() {
            None => op().await.map_err(|err| MoatError::Biz(Arc::from(err))),
            Some(retry) => {
                let operations = retry.operations();
                let mut retry_ctx = RetryContext::new();
                let result = loop {
                    retry_ctx.begin_attempt();
                    match op().await {
                        Ok(value) => break Ok(value),
                        Err(err) => match operations.on_failure(&mut retry_ctx, err) {
                            ControlFlow::Continue(delay) => {
                                if !delay.is_zero() {
                                    tokio::time::sleep(delay).await;
                                }
                            }
                            ControlFlow::Break(err) => break Err(err),
                        },
                    }
                };
                self.inner
                    .instruments
                    .retry_attempts(&resource, retry_ctx.attempts());
                result.map_err(|err| MoatError::from_retry(&resource, err))
            }
        };
        finish(handle, outcome)
    }

    /// Snapshot of the live cluster of `id`.
    pub fn metrics(&self, id: &ResourceId) -> Option<ClusterMetrics> {
        self.inner
            .cache
            .get(&self.cluster_id(id))
            .map(|cluster| cluster.metrics())
    }

    /// The fond config of the live moat of `kind` for `id`.
    pub fn fond_config(&self, id: &ResourceId, kind: MoatType) -> Option<FondConfig> {
        self.inner
            .cache
            .get(&self.cluster_id(id))?
            .get(kind)
            .map(|moat| moat.fond_config())
    }

    /// Drops the cluster of `id`; the next call rebuilds it.
    pub fn remove(&self, id: &ResourceId) -> bool {
        self.inner.cache.remove(&self.cluster_id(id)).is_some()
    }

    pub fn registries(&self) -> &Registries {
        &self.inner.factory.registries
    }

    /// Live per-argument moats under `key`.
    pub fn creation_count(&self, key: &ArgConfigKey) -> usize {
        self.inner.factory.creation.count(key)
    }

    pub fn cluster_count(&self) -> usize {
        self.inner.cache.len()
    }
}

/// Ends the handle with the outcome and applies the fallback to failures.
fn finish<T: 'static>(mut handle: Handle, outcome: Result<T, MoatError>) -> Result<T, MoatError> {
    match outcome {
        Ok(value) => {
            handle.end_with_success()?;
            Ok(value)
        }
        Err(err) => {
            match err.biz_cause() {
                Some(cause) => handle.end_with_error(Arc::clone(cause))?,
                None => handle.end_with_success()?,
            }
            match handle.recover(&err) {
                Some(recovered) => recovered.and_then(fallback::downcast),
                None => Err(err),
            }
        }
    }
}

/// Assembles a [`MoatKeeper`].
pub struct MoatKeeperBuilder {
    options: KeeperOptions,
    baselines: HashMap<ResourceId, ResourceConfig>,
    groups: HashMap<String, String>,
    source: Option<Arc<dyn ConfigSource>>,
    catalog: Arc<ErrorCatalog>,
    registries: Registries,
    clock: Clock,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for MoatKeeperBuilder {
    fn default() -> Self {
        Self {
            options: KeeperOptions::default(),
            baselines: HashMap::new(),
            groups: HashMap::new(),
            source: None,
            catalog: Arc::new(ErrorCatalog::new()),
            registries: Registries::default(),
            clock: Clock::new(),
            sleeper: Arc::new(ThreadSleeper),
        }
    }
}

impl MoatKeeperBuilder {
    pub fn options(mut self, options: KeeperOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers the baseline of `id`. Moat kinds it configures are permanent.
    pub fn baseline(mut self, id: ResourceId, config: ResourceConfig) -> Self {
        self.baselines.insert(id, config);
        self
    }

    /// Makes `methods` share the moats of the group `name`.
    pub fn group<I, S>(mut self, name: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        for method in methods {
            self.groups.insert(method.into(), name.clone());
        }
        self
    }

    pub fn config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// The catalog resolving error kind names found in overrides.
    pub fn catalog(mut self, catalog: Arc<ErrorCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn registries(mut self, registries: Registries) -> Self {
        self.registries = registries;
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Blocks between attempts of synchronous retries.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for a baseline the algorithms reject.
    pub fn build(self) -> Result<MoatKeeper, ConfigError> {
        let baselines = BaselineConfigs::new(self.baselines)?;
        let source = self
            .source
            .unwrap_or_else(|| Arc::new(InMemoryConfigSource::new()) as Arc<dyn ConfigSource>);
        let creation = Arc::new(CreationLimiter::new(
            Arc::clone(&source),
            self.options.default_max_size_limit,
        ));

        let released = Arc::clone(&creation);
        let cache = MoatClusterCache::new(
            self.options.cache_capacity,
            self.options.idle_expiry,
            self.clock.clone(),
        )
        .with_removal_listener(Arc::new(
            move |_: &ResourceId, cluster: &Arc<MoatCluster>, _: RemovalCause| {
                cluster.close(&released)
            },
        ));

        let inner = Arc::new_cyclic(|weak: &Weak<KeeperInner>| {
            let weak = weak.clone();
            source.add_cap_listener(Arc::new(
                move |key: &ArgConfigKey, old: Option<usize>, new: Option<usize>| {
                    if let Some(inner) = weak.upgrade() {
                        inner.on_cap_change(key, old, new);
                    }
                },
            ));
            KeeperInner {
                factory: MoatFactory {
                    baselines,
                    source: Arc::clone(&source),
                    catalog: self.catalog,
                    registries: self.registries,
                    creation,
                    rate_wait: self.options.rate_limit_wait,
                    clock: self.clock,
                    sleeper: self.sleeper,
                },
                cache,
                groups: self.groups,
                default_max_size_limit: self.options.default_max_size_limit,
                instruments: Instruments::default(),
            }
        });
        Ok(MoatKeeper { inner })
    }
}
