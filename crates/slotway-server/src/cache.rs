//! Versioned Cache
//!
//! Pull-based cache of a persisted record. Each dispatch loop calls
//! `refresh_if_stale` once per iteration with the cheaply read persisted
//! version; the record itself is reloaded only when that version moved.

use slotway_core::{MigrationRecord, Result, SlotTable};
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

/// Records that carry their own monotonic version.
pub trait Versioned {
    fn version(&self) -> u64;
}

impl Versioned for SlotTable {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for MigrationRecord {
    fn version(&self) -> u64 {
        self.revision
    }
}

struct Entry<T> {
    version: u64,
    value: Option<Arc<T>>,
}

pub struct VersionedCache<T> {
    entry: RwLock<Entry<T>>,
}

impl<T> Default for VersionedCache<T> {
    fn default() -> Self {
        Self {
            entry: RwLock::new(Entry {
                version: 0,
                value: None,
            }),
        }
    }
}

impl<T: Versioned> VersionedCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<T>> {
        self.entry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .value
            .clone()
    }

    /// Version of the cached value, 0 when empty.
    pub fn version(&self) -> u64 {
        self.entry.read().unwrap_or_else(PoisonError::into_inner).version
    }

    pub fn is_stale(&self, current_version: u64) -> bool {
        self.version() != current_version
    }

    /// Install `value` unless the cache already holds a newer version.
    pub fn store(&self, value: Option<T>) -> Option<Arc<T>> {
        let mut entry = self.entry.write().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(value) => {
                if entry.value.is_none() || value.version() >= entry.version {
                    entry.version = value.version();
                    entry.value = Some(Arc::new(value));
                }
            }
            None => {
                entry.version = 0;
                entry.value = None;
            }
        }
        entry.value.clone()
    }

    /// Record that the persisted value at `version` is absent.
    pub fn clear(&self, version: u64) {
        let mut entry = self.entry.write().unwrap_or_else(PoisonError::into_inner);
        entry.version = version;
        entry.value = None;
    }

    /// Reload through `load` when `current_version` differs from the cached
    /// version. Returns the new value when a reload happened.
    pub async fn refresh_if_stale<F, Fut>(&self, current_version: u64, load: F) -> Result<Option<Arc<T>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        if !self.is_stale(current_version) {
            return Ok(None);
        }
        let loaded = load().await?;
        Ok(self.store(loaded))
    }
}
