use std::sync::Arc;

use dashmap::DashMap;

/// Name-keyed store of shared limiter instances.
///
/// A registry is owned by whoever builds moats and passed in explicitly.
/// At most one instance is live per name: [`replace`](Self::replace) drops
/// the old entry before installing the new one.
#[derive(Debug)]
pub struct Registry<T> {
    entries: DashMap<String, Arc<T>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns the instance registered under `name`, creating it if absent.
    ///
    /// Concurrent callers for the same name all observe the same instance.
    pub fn get_or_create(&self, name: &str, create: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.get(name) {
            return existing;
        }
        let entry = self
            .entries
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(create()));
        Arc::clone(entry.value())
    }

    /// Unregisters any instance under `name` and installs `value`.
    pub fn replace(&self, name: &str, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.entries.remove(name);
        self.entries.insert(name.to_owned(), Arc::clone(&value));
        value
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<T>> {
        self.entries.remove(name).map(|(_, value)| value)
    }

    /// Unregisters `name` only while it still maps to `instance`.
    pub fn unregister_instance(&self, name: &str, instance: &Arc<T>) -> bool {
        self.entries
            .remove_if(name, |_, value| Arc::ptr_eq(value, instance))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConcurrencyLimiter;

    #[test]
    fn get_or_create_reuses_instances() {
        let registry = Registry::new();
        let a = registry.get_or_create("a", || ConcurrencyLimiter::new("a", 1));
        let b = registry.get_or_create("a", || ConcurrencyLimiter::new("a", 99));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.threshold(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn replace_and_unregister() {
        let registry = Registry::new();
        let old = registry.get_or_create("a", || ConcurrencyLimiter::new("a", 1));
        let new = registry.replace("a", ConcurrencyLimiter::new("a", 2));

        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(registry.get("a").map(|l| l.threshold()), Some(2));

        assert!(!registry.unregister_instance("a", &old));
        assert!(registry.get("a").is_some());

        assert!(registry.unregister("a").is_some());
        assert!(registry.get("a").is_none());
        assert!(registry.is_empty());
    }
}
