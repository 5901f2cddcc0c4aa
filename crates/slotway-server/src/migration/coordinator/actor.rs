//! Migration Coordinator Actor
//!
//! Serializes operator requests against the persisted plan. Driving the plan
//! through its states happens in a background driver task owned by the
//! actor.

use super::driver::CoordinatorDriver;
use super::messages::{
    CleanAll, ContinueMigrationPlan, DriverStatus, GetCurrentStatus, IsStopped, StartMigrationPlan, StopAck,
    StopCoordinator,
};
use crate::migration::MigrationContext;
use crate::observability::{events, metrics};
use crate::route::ServiceDirectory;
use chrono::Utc;
use kameo::{
    message::{Context, Message},
    Actor,
};
use slotway_core::{MigrationPlan, MigrationRecord, MigrationState, MigrationStatus, Result, RouteError};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

struct DriverTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl DriverTask {
    fn is_running(&self) -> bool {
        !self.handle.is_finished() && !*self.stop.borrow()
    }
}

#[derive(Actor)]
pub struct MigrationCoordinator {
    ctx: MigrationContext,
    /// When set, plans may only target services known to the router
    directory: Option<Arc<ServiceDirectory>>,
    driver: Option<DriverTask>,
}

impl MigrationCoordinator {
    pub fn new(ctx: MigrationContext) -> Self {
        Self {
            ctx,
            directory: None,
            driver: None,
        }
    }

    pub fn with_directory(mut self, directory: Arc<ServiceDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    fn start_driver(&mut self) {
        if self.driver.as_ref().is_some_and(DriverTask::is_running) {
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(CoordinatorDriver::new(self.ctx.clone()).run(stop_rx));
        self.driver = Some(DriverTask { stop, handle });
    }

    async fn current(&self) -> Result<MigrationRecord> {
        self.ctx.store.load_migration().await?.ok_or(RouteError::NotFound)
    }

    async fn plan(&self, msg: StartMigrationPlan) -> Result<MigrationRecord> {
        if let Some(existing) = self.ctx.store.load_migration().await? {
            if !existing.state.is_terminal() {
                return Err(RouteError::AlreadyExist);
            }
        }

        self.ctx.slots.refresh_if_stale().await?;
        let table = self.ctx.slots.table().ok_or(RouteError::NotAllocated)?;
        if let Some(directory) = &self.directory {
            if let Some(missing) = msg.target_distribution.keys().find(|s| !directory.contains(s)) {
                return Err(RouteError::UnknownService(missing.clone()));
            }
        }
        let slot_diff = self.ctx.slots.compute_rebalance_diff(&msg.target_distribution)?;

        let plan = MigrationPlan {
            id: Uuid::new_v4(),
            total_slots: table.total_slots,
            bus_kind: msg.bus_kind,
            input_bus: msg.input_bus,
            output_bus: msg.output_bus,
            source_distribution: table.distribution().distribution,
            target_distribution: msg.target_distribution,
            slot_diff,
            initiated_by: msg.initiated_by,
            started_at: Utc::now(),
        };

        self.ctx
            .buses
            .provider(&plan.bus_kind)
            .map_err(RouteError::InitInputBus)?;
        let mut opened = Vec::new();
        let created = match self.open_channels(&plan, &mut opened).await {
            Ok(()) => {
                let mut record = MigrationRecord::new(plan.clone());
                if record.plan.slot_diff.is_empty() {
                    record.transition(MigrationState::Done);
                }
                self.ctx.store.create_migration(&record).await
            }
            Err(e) => Err(e),
        };
        let stored = match created {
            Ok(stored) => stored,
            Err(e) => {
                self.release_channels(&plan.bus_kind, opened).await;
                return Err(e);
            }
        };

        let plan_id = stored.plan.id.to_string();
        events::migration_plan_started(
            &plan_id,
            stored.plan.slot_diff.len(),
            stored.progress.len(),
            &stored.plan.initiated_by,
        );
        if stored.state == MigrationState::Done {
            events::migration_state_changed(&plan_id, MigrationState::Planning.as_str(), MigrationState::Done.as_str());
        }
        metrics::set_migration_state(stored.state);
        Ok(stored)
    }

    /// Open both channels of every destination, recording each opened name.
    async fn open_channels(&self, plan: &MigrationPlan, opened: &mut Vec<String>) -> Result<()> {
        for target in plan.destinations() {
            let input = plan.input_channel(&target);
            self.ctx
                .buses
                .open(&plan.bus_kind, &input)
                .await
                .map_err(RouteError::InitInputBus)?;
            opened.push(input.name);

            let output = plan.output_channel(&target);
            self.ctx
                .buses
                .open(&plan.bus_kind, &output)
                .await
                .map_err(RouteError::InitOutputBus)?;
            opened.push(output.name);
        }
        Ok(())
    }

    async fn release_channels(&self, kind: &str, mut names: Vec<String>) {
        names.sort();
        names.dedup();
        for name in names {
            if let Err(e) = self.ctx.buses.release(kind, &name).await {
                warn!(channel = %name, error = %e, "Failed to release migration channel");
            }
        }
    }
}

impl Message<StartMigrationPlan> for MigrationCoordinator {
    type Reply = Result<MigrationStatus, RouteError>;

    async fn handle(
        &mut self,
        msg: StartMigrationPlan,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let record = self.plan(msg).await?;
        if !record.state.is_terminal() {
            self.start_driver();
        }
        Ok(MigrationStatus::from(&record))
    }
}

impl Message<GetCurrentStatus> for MigrationCoordinator {
    type Reply = Result<MigrationStatus, RouteError>;

    async fn handle(
        &mut self,
        _msg: GetCurrentStatus,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let record = self.current().await?;
        Ok(MigrationStatus::from(&record))
    }
}

impl Message<ContinueMigrationPlan> for MigrationCoordinator {
    type Reply = Result<MigrationStatus, RouteError>;

    async fn handle(
        &mut self,
        _msg: ContinueMigrationPlan,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let record = self.current().await?;
        if !record.state.is_terminal() {
            info!(plan_id = %record.plan.id, state = %record.state, "Continuing migration plan");
            self.start_driver();
        }
        Ok(MigrationStatus::from(&record))
    }
}

impl Message<StopCoordinator> for MigrationCoordinator {
    type Reply = StopAck;

    async fn handle(
        &mut self,
        _msg: StopCoordinator,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let was_running = self.driver.as_ref().is_some_and(DriverTask::is_running);
        if let Some(driver) = &self.driver {
            driver.stop.send_replace(true);
        }
        StopAck { was_running }
    }
}

impl Message<IsStopped> for MigrationCoordinator {
    type Reply = DriverStatus;

    async fn handle(
        &mut self,
        _msg: IsStopped,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        DriverStatus {
            stopped: self.driver.as_ref().map_or(true, |d| d.handle.is_finished()),
        }
    }
}

impl Message<CleanAll> for MigrationCoordinator {
    type Reply = Result<MigrationStatus, RouteError>;

    async fn handle(
        &mut self,
        _msg: CleanAll,
        _ctx: &mut Context<Self, Self::Reply>,
    ) -> Self::Reply {
        let record = self.current().await?;
        if !record.state.is_terminal() {
            return Err(RouteError::AlreadyExist);
        }

        // Channels of failed plans are still open.
        let mut names = Vec::new();
        for target in record.plan.destinations() {
            names.push(record.plan.input_channel(&target).name);
            names.push(record.plan.output_channel(&target).name);
        }
        self.release_channels(&record.plan.bus_kind, names).await;
        self.ctx.store.delete_migration().await?;
        metrics::set_migration_state(MigrationState::Idle);
        info!(plan_id = %record.plan.id, state = %record.state, "Migration record removed");
        Ok(MigrationStatus::from(&record))
    }
}
