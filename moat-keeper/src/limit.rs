//! Creation caps for per-argument moats.
//!
//! Moats keyed by an argument value are created the first time a value is
//! seen, so the number of them is bounded per `(method, argument, kind)`.
//! When a cap shrinks at runtime the excess moats are removed, oldest
//! clusters kept first.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;
use tracing::info;

use crate::cache::MoatClusterCache;
use crate::cluster::close_moat;
use crate::config::ConfigSource;
use crate::moat::MoatType;
use crate::resource::ArgConfigKey;
use crate::resource::ArgValue;
use crate::resource::ResourceId;

/// The creation cap key of a moat of `kind` for `id`, if `id` is a
/// concrete argument value.
pub(crate) fn creation_key(id: &ResourceId, kind: MoatType) -> Option<ArgConfigKey> {
    id.as_arg()
        .filter(|arg| matches!(arg.value, ArgValue::Value(_)))
        .map(|arg| arg.config_key(kind))
}

/// Live counts of per-argument moats, checked against their caps.
#[derive(Debug)]
pub struct CreationLimiter {
    counts: DashMap<ArgConfigKey, usize>,
    source: Arc<dyn ConfigSource>,
    default_cap: usize,
}

impl CreationLimiter {
    pub fn new(source: Arc<dyn ConfigSource>, default_cap: usize) -> Self {
        Self {
            counts: DashMap::new(),
            source,
            default_cap,
        }
    }

    pub fn cap(&self, key: &ArgConfigKey) -> usize {
        self.source.max_size_limit(key).unwrap_or(self.default_cap)
    }

    pub fn count(&self, key: &ArgConfigKey) -> usize {
        self.counts.get(key).map(|count| *count).unwrap_or(0)
    }

    /// Reserves room for one more moat under `key`.
    pub fn try_acquire(&self, key: &ArgConfigKey) -> bool {
        let cap = self.cap(key);
        let mut count = self.counts.entry(key.clone()).or_insert(0);
        if *count >= cap {
            debug!(%key, cap, "creation cap reached, moat not created");
            return false;
        }
        *count += 1;
        true
    }

    pub fn release(&self, key: &ArgConfigKey) {
        self.counts.remove_if_mut(key, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

/// Removes the moats of `key` beyond `cap`, keeping the oldest clusters.
///
/// Clusters left without moats are dropped from the cache unless they still
/// hold a retry executor. Returns the number of moats removed.
pub(crate) fn shrink(
    cache: &MoatClusterCache,
    creation: &CreationLimiter,
    key: &ArgConfigKey,
    cap: usize,
) -> usize {
    let mut removed = 0;
    let holders = cache.clusters().into_iter().filter(|(id, cluster)| {
        id.as_arg()
            .is_some_and(|arg| arg.same_argument(&key.method, &key.arg_name))
            && cluster.has(key.moat_type)
    });
    for (id, cluster) in holders.skip(cap) {
        let Some(moat) = cluster.remove(key.moat_type) else {
            continue;
        };
        close_moat(moat.as_ref(), creation);
        removed += 1;
        if cluster.is_empty() {
            cache.remove_if_same(&id, &cluster);
        }
    }
    if removed > 0 {
        info!(%key, cap, removed, "removed moats over the creation cap");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InMemoryConfigSource;

    #[test]
    fn refuses_once_at_cap_and_frees_on_release() {
        let source = Arc::new(InMemoryConfigSource::new());
        let key = ArgConfigKey::new("m", "a", MoatType::Rate);
        source.set_max_size_limit(key.clone(), Some(2));
        let creation = CreationLimiter::new(source, 100);

        assert!(creation.try_acquire(&key));
        assert!(creation.try_acquire(&key));
        assert!(!creation.try_acquire(&key));
        assert_eq!(creation.count(&key), 2);

        creation.release(&key);
        assert!(creation.try_acquire(&key));

        creation.release(&key);
        creation.release(&key);
        assert_eq!(creation.count(&key), 0);
        assert!(creation.counts.is_empty());
    }

    #[test]
    fn default_cap_applies_without_source_cap() {
        let creation = CreationLimiter::new(Arc::new(InMemoryConfigSource::new()), 1);
        let key = ArgConfigKey::new("m", "a", MoatType::Concurrent);
        assert_eq!(creation.cap(&key), 1);
        assert!(creation.try_acquire(&key));
        assert!(!creation.try_acquire(&key));
    }

    #[test]
    fn only_concrete_values_are_capped() {
        assert_eq!(
            creation_key(&ResourceId::arg("m", "a", "1"), MoatType::Rate),
            Some(ArgConfigKey::new("m", "a", MoatType::Rate))
        );
        assert_eq!(creation_key(&ResourceId::arg_wildcard("m", "a"), MoatType::Rate), None);
        assert_eq!(creation_key(&ResourceId::method("m"), MoatType::Rate), None);
    }
}
