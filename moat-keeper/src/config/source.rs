use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::ExternalConfig;
use crate::resource::ArgConfigKey;
use crate::resource::ResourceId;

/// Called with `(key, old cap, new cap)` whenever a creation cap changes.
pub type CapListener = Arc<dyn Fn(&ArgConfigKey, Option<usize>, Option<usize>) + Send + Sync>;

/// Supplies dynamic overrides and creation caps.
pub trait ConfigSource: Send + Sync + fmt::Debug {
    /// The latest override for `id`, if any.
    fn config(&self, id: &ResourceId) -> Option<ExternalConfig>;

    /// The per-argument creation cap for `key`, if one is configured.
    fn max_size_limit(&self, key: &ArgConfigKey) -> Option<usize>;

    fn add_cap_listener(&self, listener: CapListener);
}

/// A [`ConfigSource`] held in memory and updated programmatically.
#[derive(Default)]
pub struct InMemoryConfigSource {
    configs: DashMap<ResourceId, ExternalConfig>,
    caps: DashMap<ArgConfigKey, usize>,
    listeners: RwLock<Vec<CapListener>>,
}

impl fmt::Debug for InMemoryConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryConfigSource")
            .field("configs", &self.configs)
            .field("caps", &self.caps)
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl InMemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the override for `id` wholesale.
    pub fn set_config(&self, id: ResourceId, config: ExternalConfig) {
        debug!(resource = %id, "external config set");
        self.configs.insert(id, config);
    }

    pub fn remove_config(&self, id: &ResourceId) -> Option<ExternalConfig> {
        debug!(resource = %id, "external config removed");
        self.configs.remove(id).map(|(_, config)| config)
    }

    /// Sets or clears a creation cap and notifies the listeners.
    pub fn set_max_size_limit(&self, key: ArgConfigKey, cap: Option<usize>) {
        let old = match cap {
            Some(cap) => self.caps.insert(key.clone(), cap),
            None => self.caps.remove(&key).map(|(_, cap)| cap),
        };
        if old == cap {
            return;
        }
        debug!(%key, ?old, new = ?cap, "creation cap changed");
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&key, old, cap);
        }
    }
}

impl ConfigSource for InMemoryConfigSource {
    fn config(&self, id: &ResourceId) -> Option<ExternalConfig> {
        self.configs.get(id).map(|config| config.value().clone())
    }

    fn max_size_limit(&self, key: &ArgConfigKey) -> Option<usize> {
        self.caps.get(key).map(|cap| *cap.value())
    }

    fn add_cap_listener(&self, listener: CapListener) {
        self.listeners.write().push(listener);
    }
}
