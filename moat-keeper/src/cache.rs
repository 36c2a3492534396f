use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use lru::LruCache;
use parking_lot::Mutex;
use quanta::Clock;
use quanta::Instant;
use tracing::debug;

use crate::cluster::MoatCluster;
use crate::resource::ResourceId;

/// Why a cluster left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    Explicit,
    /// Evicted to stay within capacity.
    Size,
    /// Idle for longer than the expiry.
    Expired,
}

pub type RemovalListener = Arc<dyn Fn(&ResourceId, &Arc<MoatCluster>, RemovalCause) + Send + Sync>;

#[derive(Debug)]
struct CacheEntry {
    cluster: Arc<MoatCluster>,
    /// Insertion order, for first-seen iteration.
    seq: u64,
    /// Nanoseconds since the cache anchor.
    last_access: AtomicU64,
}

/// Clusters by resource, bounded in size and idle time.
///
/// Eviction is lazy: expired entries go on access or on [`reap_expired`],
/// and the least recently used entry goes when an insert exceeds capacity.
/// Recency is approximate: a read skips promotion while another thread
/// holds the recency index. The removal listener always runs outside the
/// map locks.
///
/// [`reap_expired`]: Self::reap_expired
pub struct MoatClusterCache {
    entries: DashMap<ResourceId, CacheEntry>,
    capacity: usize,
    idle_expiry: Duration,
    clock: Clock,
    anchor: Instant,
    next_seq: AtomicU64,
    /// Ids from least to most recently used.
    recency: Mutex<LruCache<ResourceId, ()>>,
    listener: Option<RemovalListener>,
}

impl fmt::Debug for MoatClusterCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MoatClusterCache")
            .field("len", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("idle_expiry", &self.idle_expiry)
            .finish_non_exhaustive()
    }
}

impl MoatClusterCache {
    pub fn new(capacity: usize, idle_expiry: Duration, clock: Clock) -> Self {
        let anchor = clock.now();
        Self {
            entries: DashMap::new(),
            capacity,
            idle_expiry,
            clock,
            anchor,
            next_seq: AtomicU64::new(0),
            recency: Mutex::new(LruCache::unbounded()),
            listener: None,
        }
    }

    pub fn with_removal_listener(mut self, listener: RemovalListener) -> Self {
        self.listener = Some(listener);
        self
    }

    fn now(&self) -> u64 {
        self.clock.now().duration_since(self.anchor).as_nanos() as u64
    }

    fn is_expired(&self, entry: &CacheEntry, now: u64) -> bool {
        let idle = now.saturating_sub(entry.last_access.load(Ordering::Relaxed));
        Duration::from_nanos(idle) >= self.idle_expiry
    }

    fn notify(&self, id: &ResourceId, cluster: &Arc<MoatCluster>, cause: RemovalCause) {
        debug!(resource = %id, ?cause, "cluster removed from cache");
        if let Some(listener) = &self.listener {
            listener(id, cluster, cause);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The live cluster of `id`, refreshing its idle timer.
    pub fn get(&self, id: &ResourceId) -> Option<Arc<MoatCluster>> {
        let now = self.now();
        let expired = {
            let entry = self.entries.get(id)?;
            if !self.is_expired(&entry, now) {
                entry.last_access.store(now, Ordering::Relaxed);
                let cluster = Arc::clone(&entry.cluster);
                drop(entry);
                if let Some(mut recency) = self.recency.try_lock() {
                    recency.promote(id);
                }
                return Some(cluster);
            }
            Arc::clone(&entry.cluster)
        };
        self.remove_with_cause(id, &expired, RemovalCause::Expired);
        None
    }

    /// The cluster of `id`, creating it on a miss.
    ///
    /// Concurrent misses for one id install a single cluster.
    pub fn get_or_insert_with(
        &self,
        id: &ResourceId,
        create: impl FnOnce() -> MoatCluster,
    ) -> Arc<MoatCluster> {
        if let Some(cluster) = self.get(id) {
            return cluster;
        }
        let now = self.now();
        let (cluster, inserted) = match self.entries.entry(id.clone()) {
            Entry::Occupied(entry) => {
                entry.get().last_access.store(now, Ordering::Relaxed);
                (Arc::clone(&entry.get().cluster), false)
            }
            Entry::Vacant(entry) => {
                let cluster = Arc::new(create());
                entry.insert(CacheEntry {
                    cluster: Arc::clone(&cluster),
                    seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                    last_access: AtomicU64::new(now),
                });
                (cluster, true)
            }
        };
        if inserted {
            self.recency.lock().push(id.clone(), ());
            self.evict_over_capacity(id);
        } else {
            self.recency.lock().promote(id);
        }
        cluster
    }

    fn evict_over_capacity(&self, keep: &ResourceId) {
        while self.entries.len() > self.capacity {
            let victim = {
                let mut recency = self.recency.lock();
                match recency.pop_lru() {
                    Some((id, ())) if id == *keep => {
                        recency.push(id, ());
                        return;
                    }
                    Some((id, ())) => id,
                    None => return,
                }
            };
            // an id whose entry already left the cache is just dropped
            let cluster = self
                .entries
                .get(&victim)
                .map(|entry| Arc::clone(&entry.cluster));
            if let Some(cluster) = cluster {
                self.remove_with_cause(&victim, &cluster, RemovalCause::Size);
            }
        }
    }

    fn remove_with_cause(
        &self,
        id: &ResourceId,
        cluster: &Arc<MoatCluster>,
        cause: RemovalCause,
    ) -> bool {
        let removed = self
            .entries
            .remove_if(id, |_, entry| Arc::ptr_eq(&entry.cluster, cluster))
            .is_some();
        if removed {
            self.recency.lock().pop(id);
            self.notify(id, cluster, cause);
        }
        removed
    }

    pub fn remove(&self, id: &ResourceId) -> Option<Arc<MoatCluster>> {
        let (id, entry) = self.entries.remove(id)?;
        self.recency.lock().pop(&id);
        self.notify(&id, &entry.cluster, RemovalCause::Explicit);
        Some(entry.cluster)
    }

    /// Removes `id` only while it still maps to `cluster`.
    pub fn remove_if_same(&self, id: &ResourceId, cluster: &Arc<MoatCluster>) -> bool {
        self.remove_with_cause(id, cluster, RemovalCause::Explicit)
    }

    /// Every live cluster, oldest first.
    pub fn clusters(&self) -> Vec<(ResourceId, Arc<MoatCluster>)> {
        let mut clusters: Vec<_> = self
            .entries
            .iter()
            .map(|entry| (entry.seq, entry.key().clone(), Arc::clone(&entry.cluster)))
            .collect();
        clusters.sort_unstable_by_key(|(seq, _, _)| *seq);
        clusters
            .into_iter()
            .map(|(_, id, cluster)| (id, cluster))
            .collect()
    }

    /// Drops every idle entry. Returns how many went.
    pub fn reap_expired(&self) -> usize {
        let now = self.now();
        let expired: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| self.is_expired(entry.value(), now))
            .map(|entry| (entry.key().clone(), Arc::clone(&entry.cluster)))
            .collect();
        expired
            .iter()
            .filter(|(id, cluster)| self.remove_with_cause(id, cluster, RemovalCause::Expired))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    fn cluster(name: &str) -> MoatCluster {
        MoatCluster::new(ResourceId::method(name), None)
    }

    fn recording(
        cache: MoatClusterCache,
    ) -> (MoatClusterCache, Arc<Mutex<Vec<(ResourceId, RemovalCause)>>>) {
        let removed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&removed);
        let cache = cache.with_removal_listener(Arc::new(
            move |id: &ResourceId, _: &Arc<MoatCluster>, cause: RemovalCause| {
                sink.lock().push((id.clone(), cause));
            },
        ));
        (cache, removed)
    }

    #[test]
    fn concurrent_misses_install_one_cluster() {
        let cache = MoatClusterCache::new(10, Duration::from_secs(60), Clock::new());
        let id = ResourceId::method("a");

        let first = cache.get_or_insert_with(&id, || cluster("a"));
        let second = cache.get_or_insert_with(&id, || panic!("must not create twice"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_least_recently_used_over_capacity() {
        let (clock, mock) = Clock::mock();
        let (cache, removed) = recording(MoatClusterCache::new(2, Duration::from_secs(60), clock));
        let (a, b, c) = (
            ResourceId::method("a"),
            ResourceId::method("b"),
            ResourceId::method("c"),
        );

        cache.get_or_insert_with(&a, || cluster("a"));
        mock.increment(Duration::from_millis(1));
        cache.get_or_insert_with(&b, || cluster("b"));
        mock.increment(Duration::from_millis(1));
        assert!(cache.get(&a).is_some());
        mock.increment(Duration::from_millis(1));
        cache.get_or_insert_with(&c, || cluster("c"));

        assert_eq!(*removed.lock(), vec![(b.clone(), RemovalCause::Size)]);
        assert!(cache.get(&b).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn sustained_inserts_evict_in_recency_order() {
        let (clock, mock) = Clock::mock();
        let (cache, removed) = recording(MoatClusterCache::new(3, Duration::from_secs(60), clock));
        let ids: Vec<_> = (0..10)
            .map(|n| ResourceId::arg("fetch", "user", n.to_string()))
            .collect();

        for id in &ids {
            cache.get_or_insert_with(id, || MoatCluster::new(id.clone(), None));
            mock.increment(Duration::from_millis(1));
            assert!(cache.get(&ids[0]).is_some());
        }

        assert_eq!(cache.len(), 3);
        let evicted: Vec<_> = removed.lock().iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(evicted, ids[1..8].to_vec());
        assert!(cache.get(&ids[0]).is_some());
        assert!(cache.get(&ids[9]).is_some());
    }

    #[test]
    fn idle_entries_expire() {
        let (clock, mock) = Clock::mock();
        let (cache, removed) = recording(MoatClusterCache::new(10, Duration::from_secs(60), clock));
        let (a, b) = (ResourceId::method("a"), ResourceId::method("b"));
        cache.get_or_insert_with(&a, || cluster("a"));
        cache.get_or_insert_with(&b, || cluster("b"));

        mock.increment(Duration::from_secs(30));
        assert!(cache.get(&a).is_some());
        mock.increment(Duration::from_secs(30));

        assert_eq!(cache.reap_expired(), 1);
        assert_eq!(*removed.lock(), vec![(b, RemovalCause::Expired)]);
        assert!(cache.get(&a).is_some());
    }

    #[test]
    fn clusters_iterate_in_insertion_order() {
        let cache = MoatClusterCache::new(10, Duration::from_secs(60), Clock::new());
        for name in ["c", "a", "b"] {
            cache.get_or_insert_with(&ResourceId::method(name), || cluster(name));
        }
        let order: Vec<_> = cache.clusters().into_iter().map(|(id, _)| id.to_string()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);

        let stale = Arc::new(cluster("a"));
        assert!(!cache.remove_if_same(&ResourceId::method("a"), &stale));
        assert!(cache.remove(&ResourceId::method("a")).is_some());
        assert_eq!(cache.len(), 2);
    }
}
