//! Core shared types for slotway
//!
//! Slot table, bus message, migration record and error types shared by the
//! router runtime and its tooling. This crate performs no I/O.

pub mod error;
pub mod message;
pub mod migration;
pub mod slots;

pub use error::{AdminResult, BusError, Result, RouteError};
pub use message::{BusMessage, ControlCommand, EventMessage, StatefulEntity};
pub use migration::{
    BusConfig, MigrationPlan, MigrationProgress, MigrationRecord, MigrationState, MigrationStatus,
    OutputProgress, ProgressStatus,
};
pub use slots::{slot_for_key, Slot, SlotMove, SlotTable, SlotsDistribution};
