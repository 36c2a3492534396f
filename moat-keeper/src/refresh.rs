use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;

use crate::cluster::MoatCluster;
use crate::cluster::close_moat;
use crate::config::ExternalConfig;
use crate::keeper::KeeperInner;
use crate::keeper::MoatKeeper;
use crate::limit::creation_key;
use crate::moat::MoatType;
use crate::resource::ResourceId;

/// What one reconfiguration tick changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Clusters refreshed.
    pub clusters: usize,
    /// Moats and retry executors newly named by an override.
    pub added: usize,
    /// Temporary moats and retry executors whose override went away.
    pub deleted: usize,
    /// Clusters dropped because nothing was left in them.
    pub emptied: usize,
    /// Clusters dropped for being idle.
    pub expired: usize,
}

/// Pushes the latest overrides of the config source into every live
/// cluster.
#[derive(Debug, Clone)]
pub struct ConfigRefresher {
    keeper: MoatKeeper,
}

impl ConfigRefresher {
    pub fn new(keeper: MoatKeeper) -> Self {
        Self { keeper }
    }

    /// Applies one reconfiguration tick.
    pub fn tick(&self) -> RefreshSummary {
        let inner = &self.keeper.inner;
        let mut summary = RefreshSummary {
            expired: inner.cache.reap_expired(),
            ..RefreshSummary::default()
        };
        for (id, cluster) in inner.cache.clusters() {
            summary.clusters += 1;
            let external = inner.factory.external_for(&id);
            refresh_cluster(inner, &id, &cluster, external.as_ref(), &mut summary);
        }
        if summary != RefreshSummary::default() {
            debug!(?summary, "config refreshed");
        }
        summary
    }

    /// Runs [`tick`](Self::tick) every `period` on the tokio runtime until
    /// the task is aborted.
    pub fn spawn(self, period: Duration) -> JoinHandle<()> {
        info!(period = %humantime::format_duration(period), "config refresher started");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.tick();
            }
        })
    }
}

fn refresh_cluster(
    inner: &KeeperInner,
    id: &ResourceId,
    cluster: &Arc<MoatCluster>,
    external: Option<&ExternalConfig>,
    summary: &mut RefreshSummary,
) {
    for moat in cluster.moats().iter() {
        moat.refresh(external);
    }
    if let Some(retry) = cluster.retry() {
        retry.refresh(external);
    }
    cluster.refresh_fallback_toggle(external);

    if let Some(external) = external {
        for kind in MoatType::ALL {
            if !external.names(kind) || cluster.has(kind) {
                continue;
            }
            let Some(moat) = inner.factory.create_moat(id, kind, Some(external)) else {
                continue;
            };
            if cluster.add_on_absence(moat) {
                debug!(resource = %id, moat = %kind, "moat added by override");
                summary.added += 1;
            } else if let Some(key) = creation_key(id, kind) {
                inner.factory.creation.release(&key);
            }
        }
        if external.names_retry()
            && cluster.retry().is_none()
            && let Some(retry) = inner.factory.create_retry(id, Some(external))
            && cluster.set_retry_on_absence(retry)
        {
            debug!(resource = %id, "retry added by override");
            summary.added += 1;
        }
    }

    for moat in cluster.reap_deleted() {
        debug!(resource = %id, moat = %moat.moat_type(), "temporary moat deleted");
        close_moat(moat.as_ref(), &inner.factory.creation);
        summary.deleted += 1;
    }
    if let Some(retry) = cluster.reap_deleted_retry() {
        debug!(resource = %id, "temporary retry deleted");
        retry.close();
        summary.deleted += 1;
    }

    if cluster.is_empty() && inner.cache.remove_if_same(id, cluster) {
        summary.emptied += 1;
    }
}

impl MoatKeeper {
    /// Applies one reconfiguration tick now.
    pub fn refresh(&self) -> RefreshSummary {
        ConfigRefresher::new(self.clone()).tick()
    }

    /// Refreshes from the config source every `period` in the background.
    pub fn spawn_refresher(&self, period: Duration) -> JoinHandle<()> {
        ConfigRefresher::new(self.clone()).spawn(period)
    }
}
