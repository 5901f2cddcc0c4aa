//! Named bus lookup used by dispatch loops.

use super::MessageBus;
use slotway_core::BusError;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Buses a process writes to, keyed by channel name.
#[derive(Default)]
pub struct BusRegistry {
    buses: RwLock<BTreeMap<String, Arc<dyn MessageBus>>>,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bus: Arc<dyn MessageBus>) {
        self.buses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(bus.name().to_string(), bus);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn MessageBus>> {
        self.buses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn MessageBus>, BusError> {
        self.get(name)
            .ok_or_else(|| BusError::NotRegistered(name.to_string()))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn MessageBus>> {
        self.buses
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.buses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryMessageBus;
    use std::time::Duration;

    #[test]
    fn test_register_and_lookup() {
        let registry = BusRegistry::new();
        registry.register(Arc::new(MemoryMessageBus::new("svc-a", Duration::from_millis(5))));

        assert!(registry.get("svc-a").is_some());
        assert_eq!(registry.names(), vec!["svc-a".to_string()]);
        assert!(matches!(registry.require("svc-b"), Err(BusError::NotRegistered(_))));
        assert!(registry.remove("svc-a").is_some());
        assert!(registry.get("svc-a").is_none());
    }
}
