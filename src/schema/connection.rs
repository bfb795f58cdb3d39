// =============================================================================
// Connection Service — memoized per-key client instances
// =============================================================================
//
// Repeated requests for the same composite key (`{symbol}:{strategyName}` for
// strategy cores, the exchange name for exchange cores) must observe the same
// state object. The cache creates an instance once per key and hands out
// clones of the Arc thereafter.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

pub struct InstanceCache<T> {
    instances: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Default for InstanceCache<T> {
    fn default() -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> InstanceCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The instance for `key`, creating it with `make` on first use.
    pub fn get_or_create(&self, key: &str, make: impl FnOnce() -> T) -> Arc<T> {
        if let Some(existing) = self.instances.read().get(key) {
            return Arc::clone(existing);
        }
        let mut map = self.instances.write();
        // Double-check after acquiring the write lock (another thread may
        // have created the instance meanwhile).
        if let Some(existing) = map.get(key) {
            return Arc::clone(existing);
        }
        debug!(key, "instance created");
        let instance = Arc::new(make());
        map.insert(key.to_string(), Arc::clone(&instance));
        instance
    }

    /// The instance for `key`, if one was already created.
    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.instances.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
