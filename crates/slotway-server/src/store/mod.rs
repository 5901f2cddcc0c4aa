//! Metadata Store
//!
//! Persists the two records every component synchronizes through:
//!
//! - the versioned slot table (single writer: allocation and cutover)
//! - the migration record (plan, coordinator state, per-task progress)
//!
//! Both writes are optimistic: the caller names the version or revision it
//! read and the store rejects the write if another writer got there first.

mod etcd;
mod memory;

pub use etcd::{keys, EtcdMetaStore};
pub use memory::MemoryMetaStore;

use async_trait::async_trait;
use slotway_core::{MigrationRecord, Result, RouteError, SlotTable};
use tracing::debug;

/// Attempts made by [`update_migration`] before giving up on a contended record.
const MAX_UPDATE_ATTEMPTS: usize = 16;

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn load_slot_table(&self) -> Result<Option<SlotTable>>;

    /// Persisted table version, 0 when nothing has been allocated.
    async fn slot_table_version(&self) -> Result<u64>;

    /// Store the initial table; fails with `AlreadyAllocated` if one exists.
    async fn insert_slot_table(&self, table: &SlotTable) -> Result<()>;

    /// Replace the table if the persisted version still equals
    /// `expected_version`.
    async fn replace_slot_table(&self, expected_version: u64, table: &SlotTable) -> Result<()>;

    async fn load_migration(&self) -> Result<Option<MigrationRecord>>;

    /// Revision of the migration record slot. Creates, saves and deletes all
    /// move it forward, so a new plan never reuses a revision; 0 before the
    /// first plan.
    async fn migration_revision(&self) -> Result<u64>;

    /// Store a new plan record. Fails with `AlreadyExist` while a non-terminal
    /// record is present; a terminal record is replaced.
    async fn create_migration(&self, record: &MigrationRecord) -> Result<MigrationRecord>;

    /// Write `record` if the persisted revision still equals
    /// `record.revision`; returns the stored record with its new revision.
    async fn save_migration(&self, record: &MigrationRecord) -> Result<MigrationRecord>;

    async fn delete_migration(&self) -> Result<()>;
}

/// Read-modify-write the migration record.
///
/// `apply` returns whether it changed the record; unchanged records are not
/// written. Revision conflicts reload and re-apply.
pub async fn update_migration<F>(store: &dyn MetaStore, mut apply: F) -> Result<MigrationRecord>
where
    F: FnMut(&mut MigrationRecord) -> bool + Send,
{
    let mut last_conflict = None;
    for attempt in 0..MAX_UPDATE_ATTEMPTS {
        let mut record = store.load_migration().await?.ok_or(RouteError::NotFound)?;
        if !apply(&mut record) {
            return Ok(record);
        }
        record.updated_at = chrono::Utc::now();
        match store.save_migration(&record).await {
            Ok(saved) => return Ok(saved),
            Err(conflict @ RouteError::VersionConflict { .. }) => {
                debug!(attempt, error = %conflict, "Migration record contended, retrying");
                last_conflict = Some(conflict);
                tokio::task::yield_now().await;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_conflict.unwrap_or(RouteError::Store("migration update retries exhausted".to_string())))
}
