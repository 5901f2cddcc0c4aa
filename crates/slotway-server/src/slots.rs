//! Slots Manager
//!
//! Owns the process-local view of the slot table. Lookups are synchronous
//! reads of the cached table; `refresh_if_stale` pulls a newer table from the
//! metadata store when the persisted version moved.
//!
//! ```text
//!  MetaStore ──version──▶ refresh_if_stale ──reload──▶ VersionedCache<SlotTable>
//!                                                          │
//!            get_service_by_key / get_slots_by_service_name ◀┘
//! ```

use crate::cache::VersionedCache;
use crate::observability::{events, metrics};
use crate::store::MetaStore;
use slotway_core::slots::{rebalance_moves, SlotTable};
use slotway_core::{Result, RouteError, Slot, SlotMove, SlotsDistribution};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

pub struct SlotsManager {
    store: Arc<dyn MetaStore>,
    table: VersionedCache<SlotTable>,
}

impl SlotsManager {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self {
            store,
            table: VersionedCache::new(),
        }
    }

    /// Construct and load the current table, if one exists.
    pub async fn init(store: Arc<dyn MetaStore>) -> Result<Self> {
        let manager = Self::new(store);
        manager.refresh_if_stale().await?;
        Ok(manager)
    }

    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.store
    }

    /// Allocate `total_slots` slots across `weights` and persist the table.
    pub async fn alloc_slots(&self, total_slots: u32, weights: &BTreeMap<String, u32>) -> Result<SlotsDistribution> {
        if self.store.slot_table_version().await? != 0 {
            return Err(RouteError::AlreadyAllocated);
        }
        let table = SlotTable::allocate(total_slots, weights)?;
        self.store.insert_slot_table(&table).await?;

        let distribution = table.distribution();
        events::slots_allocated(total_slots, distribution.distribution.len(), table.version);
        self.table.store(Some(table));
        metrics::set_slot_table_version(self.table.version());
        Ok(distribution)
    }

    /// Reload the table when the persisted version differs from the cached
    /// one. Returns the new table when a reload happened.
    pub async fn refresh_if_stale(&self) -> Result<Option<Arc<SlotTable>>> {
        let previous = self.table.version();
        let current = self.store.slot_table_version().await?;
        let store = self.store.clone();
        let refreshed = self
            .table
            .refresh_if_stale(current, || async move { store.load_slot_table().await })
            .await?;
        if let Some(table) = &refreshed {
            if table.version != previous {
                events::slot_table_refreshed(previous, table.version);
                metrics::set_slot_table_version(table.version);
            }
        }
        Ok(refreshed)
    }

    /// Cached table snapshot.
    pub fn table(&self) -> Option<Arc<SlotTable>> {
        self.table.get()
    }

    pub fn version(&self) -> u64 {
        self.table.version()
    }

    pub fn total_slots(&self) -> u32 {
        self.table().map_or(0, |t| t.total_slots)
    }

    pub fn get_slot_by_key(&self, key: &str) -> Option<Slot> {
        self.table().map(|t| t.slot_for_key(key))
    }

    pub fn get_service_by_key(&self, key: &str) -> Option<String> {
        self.table()
            .and_then(|t| t.owner_of_key(key).map(str::to_string))
    }

    pub fn get_slots_by_service_name(&self, service: &str) -> BTreeSet<Slot> {
        self.table().map(|t| t.slots_of(service)).unwrap_or_default()
    }

    pub fn get_service_name_by_slot(&self, slot: Slot) -> Option<String> {
        self.table().and_then(|t| t.owner(slot).map(str::to_string))
    }

    pub fn get_slots_distribution(&self) -> SlotsDistribution {
        self.table().map(|t| t.distribution()).unwrap_or_default()
    }

    pub fn get_all_services(&self) -> BTreeSet<String> {
        self.table().map(|t| t.services()).unwrap_or_default()
    }

    /// Slot moves from the cached table to `target`.
    pub fn compute_rebalance_diff(&self, target: &BTreeMap<String, u32>) -> Result<Vec<SlotMove>> {
        let table = self.table().ok_or(RouteError::NotAllocated)?;
        rebalance_moves(&table, target)
    }

    /// Persist the table with `moves` applied, asserting the version read.
    ///
    /// Reads the authoritative table from the store first; if the moves are
    /// already applied nothing is written. Returns the resulting table.
    pub async fn apply_moves(&self, moves: &[SlotMove]) -> Result<Arc<SlotTable>> {
        let current = self.store.load_slot_table().await?.ok_or(RouteError::NotAllocated)?;
        if current.has_moves_applied(moves) {
            debug!(version = current.version, "Slot moves already applied");
            self.table.store(Some(current));
            return self.table().ok_or(RouteError::NotAllocated);
        }

        let next = current.with_moves(moves);
        self.store.replace_slot_table(current.version, &next).await?;
        info!(
            from_version = current.version,
            to_version = next.version,
            moved = moves.len(),
            "Slot table replaced"
        );
        metrics::set_slot_table_version(next.version);
        self.table.store(Some(next));
        self.table().ok_or(RouteError::NotAllocated)
    }
}
