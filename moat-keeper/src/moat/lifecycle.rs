use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use arc_swap::ArcSwap;

use crate::config::ExternalConfig;

/// Whether a moat can outlive its override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeCycleType {
    /// No baseline: exists only while an override names it.
    Temporary,
    /// Has a baseline to return to when the override goes away.
    Permanent,
}

/// The reconfiguration protocol shared by moats and retry executors.
pub trait LifeCycle {
    type Config: Clone + PartialEq + Debug;

    /// Merges the baseline with `external`.
    ///
    /// `None` means the override carries nothing for this kind of moat.
    fn fond(&self, external: &ExternalConfig) -> Option<Self::Config>;

    fn is_config_equals(&self, candidate: &Self::Config) -> bool;

    fn update_with_newest_config(&self, candidate: Self::Config);

    /// Resets a permanent moat to its baseline, or marks a temporary one deleted.
    fn update_when_newest_config_is_null(&self);
}

/// Runs one reconfiguration step on `target`.
pub fn refresh<L>(target: &L, external: Option<&ExternalConfig>)
where
    L: LifeCycle + ?Sized,
{
    match external.and_then(|external| target.fond(external)) {
        None => target.update_when_newest_config_is_null(),
        Some(candidate) if !target.is_config_equals(&candidate) => {
            target.update_with_newest_config(candidate)
        }
        Some(_) => {}
    }
}

/// Baseline, current fond config and deletion mark of one moat.
#[derive(Debug)]
pub(crate) struct ConfigState<C> {
    baseline: Option<C>,
    current: ArcSwap<C>,
    deleted: AtomicBool,
}

impl<C: Clone + PartialEq> ConfigState<C> {
    pub(crate) fn new(baseline: Option<C>, initial: C) -> Self {
        Self {
            baseline,
            current: ArcSwap::from_pointee(initial),
            deleted: AtomicBool::new(false),
        }
    }

    pub(crate) fn lifecycle_type(&self) -> LifeCycleType {
        if self.baseline.is_some() {
            LifeCycleType::Permanent
        } else {
            LifeCycleType::Temporary
        }
    }

    pub(crate) fn baseline(&self) -> Option<&C> {
        self.baseline.as_ref()
    }

    pub(crate) fn current(&self) -> Arc<C> {
        self.current.load_full()
    }

    pub(crate) fn is_current(&self, candidate: &C) -> bool {
        **self.current.load() == *candidate
    }

    pub(crate) fn store(&self, config: C) {
        self.current.store(Arc::new(config));
    }

    /// The baseline to reset to when it differs from the current config.
    ///
    /// Marks a temporary moat deleted instead.
    pub(crate) fn reset_target(&self) -> Option<C> {
        match &self.baseline {
            Some(baseline) if !self.is_current(baseline) => Some(baseline.clone()),
            Some(_) => None,
            None => {
                self.deleted.store(true, Ordering::Release);
                None
            }
        }
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug)]
    struct Counter {
        state: ConfigState<usize>,
        updates: Mutex<Vec<usize>>,
    }

    impl LifeCycle for Counter {
        type Config = usize;

        fn fond(&self, external: &ExternalConfig) -> Option<usize> {
            external.max_concurrent_limit
        }

        fn is_config_equals(&self, candidate: &usize) -> bool {
            self.state.is_current(candidate)
        }

        fn update_with_newest_config(&self, candidate: usize) {
            self.updates.lock().push(candidate);
            self.state.store(candidate);
        }

        fn update_when_newest_config_is_null(&self) {
            if let Some(baseline) = self.state.reset_target() {
                self.update_with_newest_config(baseline);
            }
        }
    }

    fn counter(baseline: Option<usize>) -> Counter {
        Counter {
            state: ConfigState::new(baseline, baseline.unwrap_or(1)),
            updates: Mutex::new(Vec::new()),
        }
    }

    fn limit(n: usize) -> ExternalConfig {
        ExternalConfig {
            max_concurrent_limit: Some(n),
            ..ExternalConfig::default()
        }
    }

    #[test]
    fn equal_fond_is_not_reapplied() {
        let c = counter(Some(5));
        refresh(&c, Some(&limit(7)));
        refresh(&c, Some(&limit(7)));
        assert_eq!(*c.updates.lock(), vec![7]);
    }

    #[test]
    fn permanent_resets_to_baseline() {
        let c = counter(Some(5));
        refresh(&c, Some(&limit(7)));
        refresh(&c, None);
        refresh(&c, Some(&ExternalConfig::default()));

        assert_eq!(*c.updates.lock(), vec![7, 5]);
        assert_eq!(*c.state.current(), 5);
        assert_eq!(c.state.lifecycle_type(), LifeCycleType::Permanent);
        assert!(!c.state.is_deleted());
    }

    #[test]
    fn temporary_is_marked_deleted() {
        let c = counter(None);
        refresh(&c, Some(&limit(3)));
        assert!(!c.state.is_deleted());

        refresh(&c, None);
        assert!(c.state.is_deleted());
        assert_eq!(c.state.lifecycle_type(), LifeCycleType::Temporary);
    }
}
