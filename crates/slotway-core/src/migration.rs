//! Migration Records
//!
//! Persisted bookkeeping for a single slot migration plan. One
//! [`MigrationRecord`] holds the plan, the coordinator state, per-destination
//! input progress and per-source output progress. The record is the only
//! channel through which the coordinator and the migration tasks talk.
//!
//! ```text
//! IDLE → PLANNING → TRANSFERRING → VERIFYING → CUTOVER → DONE
//!           │            │             │
//!           └────────────┴─────────────┴──▶ FAILED
//! ```

use crate::slots::{Slot, SlotMove};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Configuration handed to a message bus implementation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Channel name
    pub name: String,
    /// Implementation specific options
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl BusConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: BTreeMap::new(),
        }
    }

    /// Same options on the sub-channel `<name>.<suffix>`.
    pub fn channel(&self, suffix: &str) -> Self {
        Self {
            name: format!("{}.{}", self.name, suffix),
            options: self.options.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    Idle,
    Planning,
    Transferring,
    Verifying,
    Cutover,
    Done,
    Failed,
}

impl MigrationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationState::Done | MigrationState::Failed)
    }

    /// States in which slots are in flight between owners.
    pub fn is_transferring(self) -> bool {
        matches!(
            self,
            MigrationState::Transferring | MigrationState::Verifying | MigrationState::Cutover
        )
    }

    /// Legal transitions of the coordinator state machine.
    pub fn can_transition_to(self, next: MigrationState) -> bool {
        use MigrationState::*;
        matches!(
            (self, next),
            (Idle, Planning)
                | (Planning, Transferring)
                | (Planning, Done)
                | (Transferring, Verifying)
                | (Verifying, Cutover)
                | (Cutover, Done)
                | (Planning, Failed)
                | (Transferring, Failed)
                | (Verifying, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationState::Idle => "IDLE",
            MigrationState::Planning => "PLANNING",
            MigrationState::Transferring => "TRANSFERRING",
            MigrationState::Verifying => "VERIFYING",
            MigrationState::Cutover => "CUTOVER",
            MigrationState::Done => "DONE",
            MigrationState::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for MigrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

/// A single rebalancing operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub id: Uuid,
    pub total_slots: u32,
    /// Message bus implementation carrying entities and markers
    pub bus_kind: String,
    pub input_bus: BusConfig,
    pub output_bus: BusConfig,
    pub source_distribution: BTreeMap<String, u32>,
    pub target_distribution: BTreeMap<String, u32>,
    pub slot_diff: Vec<SlotMove>,
    pub initiated_by: String,
    pub started_at: DateTime<Utc>,
}

impl MigrationPlan {
    pub fn destinations(&self) -> BTreeSet<String> {
        self.slot_diff.iter().map(|m| m.to.clone()).collect()
    }

    pub fn sources(&self) -> BTreeSet<String> {
        self.slot_diff.iter().map(|m| m.from.clone()).collect()
    }

    pub fn slots_for_target(&self, target: &str) -> BTreeSet<Slot> {
        self.slot_diff
            .iter()
            .filter(|m| m.to == target)
            .map(|m| m.slot)
            .collect()
    }

    /// Released slots of `source` mapped to their destination.
    pub fn releases_of(&self, source: &str) -> BTreeMap<Slot, String> {
        self.slot_diff
            .iter()
            .filter(|m| m.from == source)
            .map(|m| (m.slot, m.to.clone()))
            .collect()
    }

    pub fn move_for_slot(&self, slot: Slot) -> Option<&SlotMove> {
        self.slot_diff.iter().find(|m| m.slot == slot)
    }

    /// Channel the destination `target` consumes.
    pub fn input_channel(&self, target: &str) -> BusConfig {
        self.input_bus.channel(target)
    }

    /// Channel a source writes to for destination `target`.
    pub fn output_channel(&self, target: &str) -> BusConfig {
        self.output_bus.channel(target)
    }
}

/// Per-destination transfer bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub target_service: String,
    pub slots: BTreeSet<Slot>,
    pub status: ProgressStatus,
    pub received_count: u64,
    pub expected_markers: u32,
    /// Slots whose completion marker has been persisted
    #[serde(default)]
    pub finished_slots: BTreeSet<Slot>,
    /// The destination's ownership gate parks live traffic for these slots
    #[serde(default)]
    pub gate_ready: bool,
    /// Copies received for a failed plan have been removed
    #[serde(default)]
    pub discarded: bool,
    #[serde(default)]
    pub begin_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl MigrationProgress {
    pub fn new(target_service: impl Into<String>, slots: BTreeSet<Slot>) -> Self {
        let expected_markers = slots.len() as u32;
        Self {
            target_service: target_service.into(),
            slots,
            status: ProgressStatus::Pending,
            received_count: 0,
            expected_markers,
            finished_slots: BTreeSet::new(),
            gate_ready: false,
            discarded: false,
            begin_time: None,
            end_time: None,
        }
    }

    /// Every slot's completion marker has been observed.
    pub fn all_markers_seen(&self) -> bool {
        self.slots.is_subset(&self.finished_slots)
    }
}

/// Per-source scan bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputProgress {
    pub source_service: String,
    /// Released slot to destination service
    pub slots: BTreeMap<Slot, String>,
    pub status: ProgressStatus,
    /// Last entity key written; a restarted scan resumes after it
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub sent_per_slot: BTreeMap<Slot, u64>,
    /// The source's ownership gate redirects every released slot; the scan
    /// waits for it
    #[serde(default)]
    pub gate_ready: bool,
    /// Transferred entities removed from the source after cutover
    #[serde(default)]
    pub cleaned: bool,
    #[serde(default)]
    pub begin_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl OutputProgress {
    pub fn new(source_service: impl Into<String>, slots: BTreeMap<Slot, String>) -> Self {
        Self {
            source_service: source_service.into(),
            slots,
            status: ProgressStatus::Pending,
            cursor: None,
            sent_per_slot: BTreeMap::new(),
            gate_ready: false,
            cleaned: false,
            begin_time: None,
            end_time: None,
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.sent_per_slot.values().sum()
    }
}

/// The persisted migration plan record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub plan: MigrationPlan,
    pub state: MigrationState,
    /// Input progress keyed by destination service
    pub progress: BTreeMap<String, MigrationProgress>,
    /// Output progress keyed by source service
    pub outputs: BTreeMap<String, OutputProgress>,
    /// Optimistic concurrency guard, bumped by the store on every write
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationRecord {
    /// Fresh record in PLANNING with one progress entry per destination and
    /// one output entry per source.
    pub fn new(plan: MigrationPlan) -> Self {
        let progress = plan
            .destinations()
            .into_iter()
            .map(|target| {
                let slots = plan.slots_for_target(&target);
                (target.clone(), MigrationProgress::new(target, slots))
            })
            .collect();
        let outputs = plan
            .sources()
            .into_iter()
            .map(|source| {
                let slots = plan.releases_of(&source);
                (source.clone(), OutputProgress::new(source, slots))
            })
            .collect();
        Self {
            plan,
            state: MigrationState::Planning,
            progress,
            outputs,
            revision: 0,
            failure: None,
            updated_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Apply a state transition; illegal transitions are ignored and reported.
    pub fn transition(&mut self, next: MigrationState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
        }
        true
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.transition(MigrationState::Failed) {
            self.failure = Some(reason.into());
            true
        } else {
            false
        }
    }

    /// Move of `slot` while it is in flight.
    pub fn in_flight_move(&self, slot: Slot) -> Option<&SlotMove> {
        if !self.state.is_transferring() {
            return None;
        }
        self.plan.move_for_slot(slot)
    }

    /// Whether the gate of destination `target` parks its incoming slots.
    pub fn parking_ready(&self, target: &str) -> bool {
        self.progress.get(target).is_some_and(|p| p.gate_ready)
    }

    /// Every destination `source` releases slots to parks them.
    pub fn destinations_ready(&self, source: &str) -> bool {
        self.outputs
            .get(source)
            .is_some_and(|o| o.slots.values().all(|target| self.parking_ready(target)))
    }

    pub fn received_counts(&self) -> BTreeMap<String, u64> {
        self.progress
            .iter()
            .map(|(target, p)| (target.clone(), p.received_count))
            .collect()
    }
}

/// Snapshot returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub state: MigrationState,
    pub plan: MigrationPlan,
    pub progress: Vec<MigrationProgress>,
    pub outputs: Vec<OutputProgress>,
    pub failure: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&MigrationRecord> for MigrationStatus {
    fn from(record: &MigrationRecord) -> Self {
        Self {
            state: record.state,
            plan: record.plan.clone(),
            progress: record.progress.values().cloned().collect(),
            outputs: record.outputs.values().cloned().collect(),
            failure: record.failure.clone(),
            updated_at: record.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(moves: Vec<SlotMove>) -> MigrationPlan {
        MigrationPlan {
            id: Uuid::new_v4(),
            total_slots: 10,
            bus_kind: "memory".into(),
            input_bus: BusConfig::named("migration"),
            output_bus: BusConfig::named("migration"),
            source_distribution: BTreeMap::new(),
            target_distribution: BTreeMap::new(),
            slot_diff: moves,
            initiated_by: "test".into(),
            started_at: Utc::now(),
        }
    }

    fn mv(slot: Slot, from: &str, to: &str) -> SlotMove {
        SlotMove {
            slot,
            from: from.into(),
            to: to.into(),
        }
    }

    #[test]
    fn test_record_groups_by_destination_and_source() {
        let record = MigrationRecord::new(plan(vec![
            mv(1, "a", "c"),
            mv(2, "a", "d"),
            mv(7, "b", "c"),
        ]));
        assert_eq!(record.state, MigrationState::Planning);
        assert_eq!(record.progress.len(), 2);
        assert_eq!(record.progress["c"].slots, BTreeSet::from([1, 7]));
        assert_eq!(record.progress["c"].expected_markers, 2);
        assert_eq!(record.outputs["a"].slots.len(), 2);
        assert_eq!(record.outputs["b"].slots[&7], "c");
    }

    #[test]
    fn test_transitions() {
        let mut record = MigrationRecord::new(plan(vec![mv(1, "a", "b")]));
        assert!(!record.transition(MigrationState::Cutover));
        assert!(record.transition(MigrationState::Transferring));
        assert_eq!(record.in_flight_move(1).map(|m| m.to.as_str()), Some("b"));
        assert!(record.in_flight_move(2).is_none());
        assert!(record.fail("boom"));
        assert_eq!(record.failure.as_deref(), Some("boom"));
        assert!(record.finished_at.is_some());
        assert!(!record.transition(MigrationState::Verifying));
        assert!(record.in_flight_move(1).is_none());
    }

    #[test]
    fn test_markers_complete_progress() {
        let mut record = MigrationRecord::new(plan(vec![mv(3, "a", "b"), mv(4, "a", "b")]));
        if let Some(p) = record.progress.get_mut("b") {
            p.finished_slots.insert(3);
        }
        assert!(!record.progress["b"].all_markers_seen());
        if let Some(p) = record.progress.get_mut("b") {
            p.finished_slots.insert(4);
        }
        assert!(record.progress["b"].all_markers_seen());
    }

    #[test]
    fn test_sources_wait_for_every_destination_gate() {
        let mut record = MigrationRecord::new(plan(vec![mv(1, "a", "b"), mv(2, "a", "c"), mv(3, "d", "b")]));
        assert!(!record.destinations_ready("a"));
        if let Some(p) = record.progress.get_mut("b") {
            p.gate_ready = true;
        }
        assert!(record.parking_ready("b"));
        assert!(record.destinations_ready("d"));
        assert!(!record.destinations_ready("a"));
        if let Some(p) = record.progress.get_mut("c") {
            p.gate_ready = true;
        }
        assert!(record.destinations_ready("a"));
        assert!(!record.destinations_ready("unknown"));
    }

    #[test]
    fn test_channel_names() {
        let p = plan(vec![mv(3, "a", "b")]);
        assert_eq!(p.input_channel("b").name, "migration.b");
        assert_eq!(p.output_channel("b").name, "migration.b");
    }
}
