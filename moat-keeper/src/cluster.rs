use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use arc_swap::ArcSwap;
use arc_swap::ArcSwapOption;
use tracing::debug;

use crate::config::ExternalConfig;
use crate::config::FallbackConfig;
use crate::context::Args;
use crate::error::MoatError;
use crate::fallback;
use crate::fallback::FallbackValue;
use crate::limit::CreationLimiter;
use crate::limit::creation_key;
use crate::metrics::ClusterMetrics;
use crate::moat::Moat;
use crate::moat::MoatMetrics;
use crate::moat::MoatType;
use crate::resource::ResourceId;
use crate::retry::RetryExecutor;

/// The moats of one resource, at most one per kind and kept in admission
/// order, plus its retry executor and fallback.
///
/// Readers take a snapshot of the moat list; changes swap in a new list.
#[derive(Debug)]
pub struct MoatCluster {
    resource: ResourceId,
    moats: ArcSwap<Vec<Arc<dyn Moat>>>,
    retry: ArcSwapOption<RetryExecutor>,
    fallback: Option<FallbackConfig>,
    apply_fallback_to_biz: AtomicBool,
}

impl MoatCluster {
    pub fn new(resource: ResourceId, fallback: Option<FallbackConfig>) -> Self {
        let apply_fallback_to_biz = fallback
            .as_ref()
            .is_some_and(|fallback| fallback.also_apply_to_biz);
        Self {
            resource,
            moats: ArcSwap::from_pointee(Vec::new()),
            retry: ArcSwapOption::empty(),
            fallback,
            apply_fallback_to_biz: AtomicBool::new(apply_fallback_to_biz),
        }
    }

    pub fn resource_id(&self) -> &ResourceId {
        &self.resource
    }

    /// The moats in admission order.
    pub fn moats(&self) -> Arc<Vec<Arc<dyn Moat>>> {
        self.moats.load_full()
    }

    pub fn get(&self, kind: MoatType) -> Option<Arc<dyn Moat>> {
        self.moats
            .load()
            .iter()
            .find(|moat| moat.moat_type() == kind)
            .cloned()
    }

    pub fn has(&self, kind: MoatType) -> bool {
        self.moats.load().iter().any(|moat| moat.moat_type() == kind)
    }

    /// Adds `moat` unless the cluster already has one of its kind.
    pub fn add_on_absence(&self, moat: Arc<dyn Moat>) -> bool {
        let kind = moat.moat_type();
        let mut added = false;
        self.moats.rcu(|moats| {
            added = !moats.iter().any(|existing| existing.moat_type() == kind);
            let mut next = Vec::clone(moats);
            if added {
                next.push(Arc::clone(&moat));
                next.sort_by_key(|moat| moat.moat_type());
            }
            next
        });
        added
    }

    pub fn remove(&self, kind: MoatType) -> Option<Arc<dyn Moat>> {
        let previous = self.moats.rcu(|moats| {
            moats
                .iter()
                .filter(|moat| moat.moat_type() != kind)
                .cloned()
                .collect::<Vec<_>>()
        });
        previous.iter().find(|moat| moat.moat_type() == kind).cloned()
    }

    /// Takes out every moat marked deleted.
    pub fn reap_deleted(&self) -> Vec<Arc<dyn Moat>> {
        if !self.moats.load().iter().any(|moat| moat.is_deleted()) {
            return Vec::new();
        }
        let previous = self.moats.rcu(|moats| {
            moats
                .iter()
                .filter(|moat| !moat.is_deleted())
                .cloned()
                .collect::<Vec<_>>()
        });
        previous
            .iter()
            .filter(|moat| moat.is_deleted())
            .cloned()
            .collect()
    }

    pub fn retry(&self) -> Option<Arc<RetryExecutor>> {
        self.retry.load_full()
    }

    pub fn set_retry_on_absence(&self, retry: Arc<RetryExecutor>) -> bool {
        let previous = self
            .retry
            .compare_and_swap(&None::<Arc<RetryExecutor>>, Some(retry));
        previous.is_none()
    }

    /// Takes out the retry executor if it is marked deleted.
    pub fn reap_deleted_retry(&self) -> Option<Arc<RetryExecutor>> {
        let retry = self.retry.load_full()?;
        if !retry.is_deleted() {
            return None;
        }
        let previous = self.retry.compare_and_swap(&Some(Arc::clone(&retry)), None);
        let swapped = matches!(&*previous, Some(previous) if Arc::ptr_eq(previous, &retry));
        swapped.then_some(retry)
    }

    /// No moats and no retry executor.
    pub fn is_empty(&self) -> bool {
        self.moats.load().is_empty() && self.retry.load().is_none()
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    /// Recovers `err` through the fallback, if one is configured and
    /// applicable.
    pub fn fallback_for(
        &self,
        err: &MoatError,
        args: Option<&Args>,
    ) -> Option<Result<FallbackValue, MoatError>> {
        let config = self.fallback.as_ref()?;
        let apply_to_biz = self.apply_fallback_to_biz.load(Ordering::Relaxed);
        if !fallback::is_applicable(err, apply_to_biz) {
            return None;
        }
        config.handler.handle(err, args)
    }

    /// Applies the override's fallback toggle, falling back to the baseline.
    pub fn refresh_fallback_toggle(&self, external: Option<&ExternalConfig>) {
        let baseline = self
            .fallback
            .as_ref()
            .is_some_and(|fallback| fallback.also_apply_to_biz);
        let apply = external
            .and_then(|external| external.also_apply_fallback_to_biz_exception)
            .unwrap_or(baseline);
        if self.apply_fallback_to_biz.swap(apply, Ordering::Relaxed) != apply {
            debug!(resource = %self.resource, apply, "fallback on business errors toggled");
        }
    }

    pub fn metrics(&self) -> ClusterMetrics {
        let mut metrics = ClusterMetrics::empty(self.resource.clone());
        for moat in self.moats.load().iter() {
            match moat.metrics() {
                MoatMetrics::Concurrent(m) => metrics.concurrent = Some(m),
                MoatMetrics::CircuitBreaker(m) => metrics.breaker = Some(m),
                MoatMetrics::Rate(m) => metrics.rate = Some(m),
            }
        }
        metrics.retry = self.retry.load_full().map(|retry| retry.metrics());
        metrics
    }

    /// Closes every moat and the retry executor, returning their creation
    /// slots.
    pub(crate) fn close(&self, creation: &CreationLimiter) {
        let moats = self.moats.swap(Arc::new(Vec::new()));
        for moat in moats.iter() {
            close_moat(moat.as_ref(), creation);
        }
        if let Some(retry) = self.retry.swap(None) {
            retry.close();
        }
    }
}

/// Closes a moat taken out of its cluster.
pub(crate) fn close_moat(moat: &dyn Moat, creation: &CreationLimiter) {
    moat.close();
    if let Some(key) = creation_key(moat.resource_id(), moat.moat_type()) {
        creation.release(&key);
    }
}

#[cfg(test)]
mod tests {
    use moat_limit::Registry;

    use super::*;
    use crate::config::ConcurrentLimitConfig;
    use crate::config::InMemoryConfigSource;
    use crate::moat::ConcurrentMoat;

    fn concurrent(id: &ResourceId, baseline: Option<usize>) -> Arc<dyn Moat> {
        Arc::new(ConcurrentMoat::new(
            id.clone(),
            baseline.map(ConcurrentLimitConfig::new),
            ConcurrentLimitConfig::new(baseline.unwrap_or(1)),
            Arc::new(Registry::new()),
        ))
    }

    #[test]
    fn one_moat_per_kind() {
        let id = ResourceId::method("m");
        let cluster = MoatCluster::new(id.clone(), None);

        assert!(cluster.add_on_absence(concurrent(&id, Some(1))));
        assert!(!cluster.add_on_absence(concurrent(&id, Some(2))));
        assert_eq!(cluster.moats().len(), 1);

        assert!(cluster.remove(MoatType::Concurrent).is_some());
        assert!(cluster.remove(MoatType::Concurrent).is_none());
        assert!(cluster.is_empty());
    }

    #[test]
    fn deleted_moats_are_reaped() {
        let id = ResourceId::method("m");
        let cluster = MoatCluster::new(id.clone(), None);
        cluster.add_on_absence(concurrent(&id, None));

        assert!(cluster.reap_deleted().is_empty());
        cluster.moats()[0].refresh(None);
        assert_eq!(cluster.reap_deleted().len(), 1);
        assert!(cluster.is_empty());
    }

    #[test]
    fn close_releases_creation_slots() {
        let id = ResourceId::arg("m", "a", "1");
        let source = Arc::new(InMemoryConfigSource::new());
        let creation = CreationLimiter::new(source, 10);
        let key = creation_key(&id, MoatType::Concurrent).unwrap();
        assert!(creation.try_acquire(&key));

        let cluster = MoatCluster::new(id.clone(), None);
        cluster.add_on_absence(concurrent(&id, Some(1)));
        cluster.close(&creation);

        assert_eq!(creation.count(&key), 0);
        assert!(cluster.is_empty());
    }
}
