//! Stateful Entity Store
//!
//! Storage seam for the per-key entities ("activity threads") owned by a
//! service. The execution engine writes entities; the migration tasks scan,
//! bulk-save and remove them.

use async_trait::async_trait;
use slotway_core::{Result, StatefulEntity};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Up to `limit` entities with keys strictly greater than `after`, in
    /// ascending key order. Restarting from the last returned key never skips
    /// an entity.
    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<StatefulEntity>>;

    async fn get(&self, key: &str) -> Result<Option<StatefulEntity>>;

    /// Engine-side write of a single entity.
    async fn save(&self, entity: StatefulEntity) -> Result<()>;

    /// Idempotent bulk upsert keyed by entity key. An incoming entity replaces
    /// the stored one only when its revision is higher, so replaying a batch
    /// writes nothing. Returns the number of entities written.
    async fn batch_save(&self, entities: Vec<StatefulEntity>) -> Result<usize>;

    /// Remove the given keys; returns the number that existed.
    async fn remove(&self, keys: &[String]) -> Result<usize>;

    async fn count(&self) -> Result<usize>;
}

/// Ordered in-memory entity store.
#[derive(Default)]
pub struct MemoryEntityStore {
    entities: Mutex<BTreeMap<String, StatefulEntity>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entities(&self) -> MutexGuard<'_, BTreeMap<String, StatefulEntity>> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entities().keys().cloned().collect()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn scan(&self, after: Option<&str>, limit: usize) -> Result<Vec<StatefulEntity>> {
        let entities = self.entities();
        let lower = match after {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Unbounded,
        };
        Ok(entities
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, entity)| entity.clone())
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Option<StatefulEntity>> {
        Ok(self.entities().get(key).cloned())
    }

    async fn save(&self, entity: StatefulEntity) -> Result<()> {
        self.entities().insert(entity.key.clone(), entity);
        Ok(())
    }

    async fn batch_save(&self, entities: Vec<StatefulEntity>) -> Result<usize> {
        let mut stored = self.entities();
        let mut written = 0;
        for entity in entities {
            let keep_existing = stored
                .get(&entity.key)
                .is_some_and(|existing| existing.revision >= entity.revision);
            if !keep_existing {
                stored.insert(entity.key.clone(), entity);
                written += 1;
            }
        }
        Ok(written)
    }

    async fn remove(&self, keys: &[String]) -> Result<usize> {
        let mut stored = self.entities();
        Ok(keys.iter().filter(|key| stored.remove(*key).is_some()).count())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entities().len())
    }
}
