//! Service name to bus name resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};
use tracing::info;

/// Known services and the bus each one consumes.
#[derive(Debug, Default)]
pub struct ServiceDirectory {
    services: RwLock<BTreeMap<String, String>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory where every service consumes a bus named after itself.
    pub fn from_services<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let directory = Self::new();
        for service in services {
            let service = service.into();
            directory.register(service.clone(), service);
        }
        directory
    }

    pub fn register(&self, service: impl Into<String>, bus: impl Into<String>) {
        let (service, bus) = (service.into(), bus.into());
        info!(service = %service, bus = %bus, "Registered service");
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service, bus);
    }

    pub fn remove(&self, service: &str) -> Option<String> {
        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(service)
    }

    pub fn bus_of(&self, service: &str) -> Option<String> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    pub fn contains(&self, service: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(service)
    }

    pub fn names(&self) -> BTreeSet<String> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
