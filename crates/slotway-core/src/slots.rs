//! Slot Table
//!
//! The fixed slot space, its versioned ownership table, and the pure
//! algorithms that operate on it:
//!
//! - `slot_for_key`: stable key hash (FNV-1 with an avalanche finish) mod N
//! - `allocate_assignment`: proportional contiguous ranges for initial allocation
//! - `rebalance_moves`: minimal slot moves from the current table to a target
//!   distribution
//!
//! ```text
//! key ──hash──▶ slot ∈ [0, N) ──assignment──▶ service
//! ```

use crate::error::{Result, RouteError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Slot identifier in `[0, N)`.
pub type Slot = u32;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// Hash a routing key into 32 bits.
///
/// FNV-1 over the UTF-8 bytes, followed by shift/add mixing so that keys with
/// a shared prefix still spread across small slot counts. The result depends
/// only on the key bytes, so every process maps a key identically.
pub fn key_hash(key: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.bytes() {
        hash = (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME);
    }
    hash = hash.wrapping_add(hash << 13);
    hash ^= hash >> 7;
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 17;
    hash.wrapping_add(hash << 5)
}

/// Map a routing key to its slot for a table of `total_slots` slots.
pub fn slot_for_key(key: &str, total_slots: u32) -> Slot {
    if total_slots == 0 {
        return 0;
    }
    key_hash(key) % total_slots
}

/// Per-service slot counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotsDistribution {
    /// Total number of slots (N)
    pub slots: u32,
    /// Slot count per service
    pub distribution: BTreeMap<String, u32>,
}

impl SlotsDistribution {
    /// Sum of all per-service counts.
    pub fn allocated(&self) -> u64 {
        self.distribution.values().map(|c| u64::from(*c)).sum()
    }
}

/// A single ownership change of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotMove {
    pub slot: Slot,
    pub from: String,
    pub to: String,
}

/// Versioned slot ownership table.
///
/// `assignment[slot]` is the owning service; the vector always has exactly
/// `total_slots` entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotTable {
    pub total_slots: u32,
    pub assignment: Vec<String>,
    pub version: u64,
}

impl SlotTable {
    /// Build the initial table (version 1) for the given weights.
    pub fn allocate(total_slots: u32, weights: &BTreeMap<String, u32>) -> Result<Self> {
        let assignment = allocate_assignment(total_slots, weights)?;
        Ok(Self {
            total_slots,
            assignment,
            version: 1,
        })
    }

    pub fn slot_for_key(&self, key: &str) -> Slot {
        slot_for_key(key, self.total_slots)
    }

    /// Owning service of a slot, `None` when the slot is out of range.
    pub fn owner(&self, slot: Slot) -> Option<&str> {
        self.assignment.get(slot as usize).map(String::as_str)
    }

    pub fn owner_of_key(&self, key: &str) -> Option<&str> {
        self.owner(self.slot_for_key(key))
    }

    pub fn slots_of(&self, service: &str) -> BTreeSet<Slot> {
        self.assignment
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.as_str() == service)
            .map(|(slot, _)| slot as Slot)
            .collect()
    }

    /// Ascending slot lists keyed by service name.
    pub fn slots_by_service(&self) -> BTreeMap<String, Vec<Slot>> {
        let mut by_service: BTreeMap<String, Vec<Slot>> = BTreeMap::new();
        for (slot, owner) in self.assignment.iter().enumerate() {
            by_service.entry(owner.clone()).or_default().push(slot as Slot);
        }
        by_service
    }

    pub fn distribution(&self) -> SlotsDistribution {
        let mut distribution = BTreeMap::new();
        for owner in &self.assignment {
            *distribution.entry(owner.clone()).or_insert(0) += 1;
        }
        SlotsDistribution {
            slots: self.total_slots,
            distribution,
        }
    }

    pub fn services(&self) -> BTreeSet<String> {
        self.assignment.iter().cloned().collect()
    }

    /// Table with every move applied and the version bumped.
    pub fn with_moves(&self, moves: &[SlotMove]) -> Self {
        let mut assignment = self.assignment.clone();
        for m in moves {
            if let Some(owner) = assignment.get_mut(m.slot as usize) {
                *owner = m.to.clone();
            }
        }
        Self {
            total_slots: self.total_slots,
            assignment,
            version: self.version + 1,
        }
    }

    /// True when every move's slot is already owned by its destination.
    pub fn has_moves_applied(&self, moves: &[SlotMove]) -> bool {
        moves.iter().all(|m| self.owner(m.slot) == Some(m.to.as_str()))
    }
}

/// Lay out `total_slots` slots over services in proportion to their weights.
///
/// Each service receives `round(N * weight / sum)` slots; the rounding
/// remainder is settled one slot at a time against the largest weights (ties
/// broken by name). Ranges are contiguous and laid out in ascending service
/// name order.
pub fn allocate_assignment(total_slots: u32, weights: &BTreeMap<String, u32>) -> Result<Vec<String>> {
    if total_slots == 0 {
        return Err(RouteError::InvalidWeights(
            "total slots must be positive".to_string(),
        ));
    }
    if weights.is_empty() {
        return Err(RouteError::InvalidWeights(
            "at least one service is required".to_string(),
        ));
    }
    let weight_sum: u128 = weights.values().map(|w| u128::from(*w)).sum();
    if weight_sum == 0 {
        return Err(RouteError::InvalidWeights(
            "weights must not all be zero".to_string(),
        ));
    }

    let n = u128::from(total_slots);
    let mut counts: BTreeMap<&str, u128> = weights
        .iter()
        .map(|(service, w)| {
            let w = u128::from(*w);
            (service.as_str(), (2 * n * w + weight_sum) / (2 * weight_sum))
        })
        .collect();

    let mut order: Vec<(&str, u32)> = weights
        .iter()
        .filter(|(_, w)| **w > 0)
        .map(|(s, w)| (s.as_str(), *w))
        .collect();
    order.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut assigned: u128 = counts.values().sum();
    let mut cursor = 0usize;
    while assigned < n {
        let service = order[cursor % order.len()].0;
        if let Some(count) = counts.get_mut(service) {
            *count += 1;
            assigned += 1;
        }
        cursor += 1;
    }
    while assigned > n {
        let service = order[cursor % order.len()].0;
        if let Some(count) = counts.get_mut(service) {
            if *count > 0 {
                *count -= 1;
                assigned -= 1;
            }
        }
        cursor += 1;
    }

    let mut assignment = Vec::with_capacity(total_slots as usize);
    for (service, count) in &counts {
        for _ in 0..*count {
            assignment.push((*service).to_string());
        }
    }
    if assignment.len() != total_slots as usize {
        return Err(RouteError::InvalidWeights(format!(
            "allocated {} slots, expected {}",
            assignment.len(),
            total_slots
        )));
    }
    Ok(assignment)
}

/// Compute the slot moves that turn `table` into `target`.
///
/// Services above their target keep the lowest `target` slots they own and
/// release the rest. Released slots, ordered by (donor name, slot), fill the
/// deficits of receiving services in name order. Only released slots move, and
/// each moves exactly once, straight to its final owner. Services missing from
/// `target` are drained; services missing from the table may receive slots.
pub fn rebalance_moves(table: &SlotTable, target: &BTreeMap<String, u32>) -> Result<Vec<SlotMove>> {
    if target.is_empty() {
        return Err(RouteError::InvalidSlots(
            "target distribution is empty".to_string(),
        ));
    }
    let target_sum: u64 = target.values().map(|c| u64::from(*c)).sum();
    if target_sum != u64::from(table.total_slots) {
        return Err(RouteError::InvalidSlots(format!(
            "target distribution covers {} slots, table has {}",
            target_sum, table.total_slots
        )));
    }

    let current = table.slots_by_service();
    let mut released: Vec<(Slot, &str)> = Vec::new();
    for (service, slots) in &current {
        let keep = target.get(service).copied().unwrap_or(0) as usize;
        if slots.len() > keep {
            released.extend(slots[keep..].iter().map(|slot| (*slot, service.as_str())));
        }
    }

    let mut pool = released.into_iter();
    let mut moves = Vec::new();
    for (service, wanted) in target {
        let owned = current.get(service).map_or(0, Vec::len);
        for _ in owned..*wanted as usize {
            let Some((slot, from)) = pool.next() else {
                return Err(RouteError::InvalidSlots(
                    "released slots do not cover the receiving services".to_string(),
                ));
            };
            moves.push(SlotMove {
                slot,
                from: from.to_string(),
                to: service.clone(),
            });
        }
    }

    moves.sort_by_key(|m| m.slot);
    Ok(moves)
}
