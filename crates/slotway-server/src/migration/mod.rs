//! Live Slot Migration
//!
//! Moves slot ownership between services together with the stateful
//! entities bound to those slots, while traffic keeps flowing.
//!
//! ## Architecture
//!
//! ```text
//!  operator ──StartMigrationPlan──▶ MigrationCoordinator (actor)
//!                                        │ persists MigrationRecord
//!                                        ▼
//!                                   driver loop: PLANNING → TRANSFERRING → VERIFYING → CUTOVER → DONE
//!                                        ▲                        │                      │
//!              progress / markers        │                        │ apply_moves          │
//!  ┌─────────────────────────────────────┴──┐                     ▼                      │
//!  │ MigrationParticipant (per service)     │               SlotTable v+1                │
//!  │   MigrationOutputTask ──<base>.<to>──▶ MigrationInputTask                           │
//!  │   (scan, stream, markers, cleanup)      (dedup, batch_save, progress) ◀─────────────┘
//!  └────────────────────────────────────────┘
//! ```
//!
//! The persisted [`MigrationRecord`] is the only synchronization point: the
//! coordinator, the tasks and the ownership gates all poll it and react to
//! its state. Every component can therefore be restarted independently.

mod coordinator;
mod gate;
mod input;
mod output;
mod participant;

#[cfg(test)]
mod tests;

pub use coordinator::{
    spawn_migration_coordinator, CleanAll, ContinueMigrationPlan, CoordinatorHandle, DriverStatus,
    GetCurrentStatus, IsStopped, MigrationCoordinator, StartMigrationPlan, StopAck, StopCoordinator,
};
pub use gate::{Disposition, OwnershipGate};
pub use input::MigrationInputTask;
pub use output::MigrationOutputTask;
pub use participant::{spawn_migration_participant, MigrationParticipant, ParticipantHandle};

use crate::bus::BusFactory;
use crate::cache::VersionedCache;
use crate::config::MigrationConfig;
use crate::entity::EntityStore;
use crate::slots::SlotsManager;
use crate::store::MetaStore;
use slotway_core::{MigrationRecord, Result, Slot};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Shared handles every migration component works with.
#[derive(Clone)]
pub struct MigrationContext {
    pub store: Arc<dyn MetaStore>,
    pub slots: Arc<SlotsManager>,
    pub buses: Arc<BusFactory>,
    pub config: MigrationConfig,
}

impl MigrationContext {
    pub fn new(store: Arc<dyn MetaStore>, slots: Arc<SlotsManager>, buses: Arc<BusFactory>, config: MigrationConfig) -> Self {
        Self {
            store,
            slots,
            buses,
            config,
        }
    }
}

/// Pull the migration record into `cache` when its revision moved.
pub(crate) async fn refresh_record(
    store: &dyn MetaStore,
    cache: &VersionedCache<MigrationRecord>,
) -> Result<Option<Arc<MigrationRecord>>> {
    let current = store.migration_revision().await?;
    if !cache.is_stale(current) {
        return Ok(cache.get());
    }
    match store.load_migration().await? {
        Some(record) => Ok(cache.store(Some(record))),
        None => {
            cache.clear(current);
            Ok(None)
        }
    }
}

/// Scan `entities` page by page and remove every entity bound to one of
/// `slots`. Returns the number removed.
pub(crate) async fn remove_slot_entities(
    entities: &dyn EntityStore,
    total_slots: u32,
    slots: &BTreeSet<Slot>,
    page_size: usize,
) -> Result<usize> {
    let mut cursor: Option<String> = None;
    let mut removed = 0;
    loop {
        let page = entities.scan(cursor.as_deref(), page_size).await?;
        let Some(last_key) = page.last().map(|e| e.key.clone()) else {
            return Ok(removed);
        };
        let keys: Vec<String> = page
            .into_iter()
            .filter(|e| slots.contains(&e.slot(total_slots)))
            .map(|e| e.key)
            .collect();
        if !keys.is_empty() {
            removed += entities.remove(&keys).await?;
        }
        cursor = Some(last_key);
    }
}
