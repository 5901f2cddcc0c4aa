//! In-process metadata store.

use super::MetaStore;
use async_trait::async_trait;
use slotway_core::{MigrationRecord, Result, RouteError, SlotTable};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct State {
    table: Option<SlotTable>,
    migration: Option<MigrationRecord>,
    /// Bumped by every create, save and delete of the record
    migration_revision: u64,
}

/// [`MetaStore`] kept in memory; shared through an `Arc` it gives every
/// component in the process the same view.
#[derive(Default)]
pub struct MemoryMetaStore {
    state: Mutex<State>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn load_slot_table(&self) -> Result<Option<SlotTable>> {
        Ok(self.state().table.clone())
    }

    async fn slot_table_version(&self) -> Result<u64> {
        Ok(self.state().table.as_ref().map_or(0, |t| t.version))
    }

    async fn insert_slot_table(&self, table: &SlotTable) -> Result<()> {
        let mut state = self.state();
        if state.table.is_some() {
            return Err(RouteError::AlreadyAllocated);
        }
        state.table = Some(table.clone());
        Ok(())
    }

    async fn replace_slot_table(&self, expected_version: u64, table: &SlotTable) -> Result<()> {
        let mut state = self.state();
        let found = state.table.as_ref().map_or(0, |t| t.version);
        if found != expected_version || table.version <= expected_version {
            return Err(RouteError::VersionConflict {
                expected: expected_version,
                found,
            });
        }
        state.table = Some(table.clone());
        Ok(())
    }

    async fn load_migration(&self) -> Result<Option<MigrationRecord>> {
        Ok(self.state().migration.clone())
    }

    async fn migration_revision(&self) -> Result<u64> {
        Ok(self.state().migration_revision)
    }

    async fn create_migration(&self, record: &MigrationRecord) -> Result<MigrationRecord> {
        let mut state = self.state();
        if state.migration.as_ref().is_some_and(|existing| !existing.state.is_terminal()) {
            return Err(RouteError::AlreadyExist);
        }
        let mut stored = record.clone();
        stored.revision = state.migration_revision + 1;
        state.migration_revision = stored.revision;
        state.migration = Some(stored.clone());
        Ok(stored)
    }

    async fn save_migration(&self, record: &MigrationRecord) -> Result<MigrationRecord> {
        let mut state = self.state();
        let found = state
            .migration
            .as_ref()
            .map(|r| r.revision)
            .ok_or(RouteError::NotFound)?;
        if found != record.revision {
            return Err(RouteError::VersionConflict {
                expected: record.revision,
                found,
            });
        }
        let mut stored = record.clone();
        stored.revision = found + 1;
        state.migration_revision = stored.revision;
        state.migration = Some(stored.clone());
        Ok(stored)
    }

    async fn delete_migration(&self) -> Result<()> {
        let mut state = self.state();
        if state.migration.take().is_some() {
            state.migration_revision += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::update_migration;
    use chrono::Utc;
    use slotway_core::{BusConfig, MigrationPlan, MigrationState, SlotMove};
    use std::collections::BTreeMap;

    fn table(version: u64) -> SlotTable {
        SlotTable {
            total_slots: 2,
            assignment: vec!["a".into(), "b".into()],
            version,
        }
    }

    fn record() -> MigrationRecord {
        MigrationRecord::new(MigrationPlan {
            id: uuid::Uuid::new_v4(),
            total_slots: 2,
            bus_kind: "memory".into(),
            input_bus: BusConfig::named("m"),
            output_bus: BusConfig::named("m"),
            source_distribution: BTreeMap::new(),
            target_distribution: BTreeMap::new(),
            slot_diff: vec![SlotMove {
                slot: 1,
                from: "b".into(),
                to: "a".into(),
            }],
            initiated_by: "test".into(),
            started_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_slot_table_cas() {
        let store = MemoryMetaStore::new();
        assert_eq!(store.slot_table_version().await.unwrap(), 0);
        store.insert_slot_table(&table(1)).await.unwrap();
        assert_eq!(
            store.insert_slot_table(&table(1)).await,
            Err(RouteError::AlreadyAllocated)
        );

        store.replace_slot_table(1, &table(2)).await.unwrap();
        assert_eq!(
            store.replace_slot_table(1, &table(3)).await,
            Err(RouteError::VersionConflict {
                expected: 1,
                found: 2
            })
        );
        assert_eq!(store.slot_table_version().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_single_active_migration() {
        let store = MemoryMetaStore::new();
        let stored = store.create_migration(&record()).await.unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(
            store.create_migration(&record()).await.err(),
            Some(RouteError::AlreadyExist)
        );

        update_migration(&store, |r| r.fail("stuck")).await.unwrap();
        let replaced = store.create_migration(&record()).await.unwrap();
        assert_eq!(replaced.state, MigrationState::Planning);
        assert!(replaced.revision > stored.revision);
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let store = MemoryMetaStore::new();
        let stored = store.create_migration(&record()).await.unwrap();
        let mut first = stored.clone();
        first.failure = Some("first".into());
        store.save_migration(&first).await.unwrap();

        let mut stale = stored;
        stale.failure = Some("stale".into());
        assert!(matches!(
            store.save_migration(&stale).await,
            Err(RouteError::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_skips_unchanged() {
        let store = MemoryMetaStore::new();
        store.create_migration(&record()).await.unwrap();
        let before = store.migration_revision().await.unwrap();
        update_migration(&store, |_| false).await.unwrap();
        assert_eq!(store.migration_revision().await.unwrap(), before);

        store.delete_migration().await.unwrap();
        assert_eq!(
            update_migration(&store, |_| true).await.err(),
            Some(RouteError::NotFound)
        );
    }

    #[tokio::test]
    async fn test_revision_survives_delete() {
        let store = MemoryMetaStore::new();
        let first = store.create_migration(&record()).await.unwrap();
        update_migration(&store, |r| r.fail("stuck")).await.unwrap();
        let before_delete = store.migration_revision().await.unwrap();

        store.delete_migration().await.unwrap();
        let after_delete = store.migration_revision().await.unwrap();
        assert!(after_delete > before_delete);

        let second = store.create_migration(&record()).await.unwrap();
        assert!(second.revision > after_delete);
        assert!(second.revision > first.revision);
        assert_eq!(store.migration_revision().await.unwrap(), second.revision);
    }
}
