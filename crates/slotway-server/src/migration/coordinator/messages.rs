//! Coordinator Message Types

use kameo::Reply;
use serde::Serialize;
use slotway_core::BusConfig;
use std::collections::BTreeMap;

/// Start a migration towards `target_distribution`
#[derive(Debug, Clone)]
pub struct StartMigrationPlan {
    /// Bus implementation used for the migration channels
    pub bus_kind: String,
    pub input_bus: BusConfig,
    pub output_bus: BusConfig,
    pub target_distribution: BTreeMap<String, u32>,
    pub initiated_by: String,
}

/// Status of the active (or last finished) plan
#[derive(Debug, Clone)]
pub struct GetCurrentStatus;

/// Resume driving a persisted plan, e.g. after a coordinator restart
#[derive(Debug, Clone)]
pub struct ContinueMigrationPlan;

/// Stop the driver loop; the persisted plan is left as is
#[derive(Debug, Clone)]
pub struct StopCoordinator;

#[derive(Debug, Clone, Serialize, Reply)]
pub struct StopAck {
    pub was_running: bool,
}

#[derive(Debug, Clone)]
pub struct IsStopped;

#[derive(Debug, Clone, Serialize, Reply)]
pub struct DriverStatus {
    pub stopped: bool,
}

/// Remove a finished plan so a new one can start from a clean record
#[derive(Debug, Clone)]
pub struct CleanAll;
