//! Migration Coordinator
//!
//! kameo actor owning the lifecycle of a migration plan, plus a typed handle
//! for callers that only care about the replies.

mod actor;
mod driver;
mod messages;

pub use actor::MigrationCoordinator;
pub use messages::{
    CleanAll, ContinueMigrationPlan, DriverStatus, GetCurrentStatus, IsStopped, StartMigrationPlan, StopAck,
    StopCoordinator,
};

use kameo::actor::ActorRef;
use kameo::error::SendError;
use kameo::Actor;
use slotway_core::{MigrationStatus, Result, RouteError};

#[derive(Clone)]
pub struct CoordinatorHandle {
    actor: ActorRef<MigrationCoordinator>,
}

fn unavailable() -> RouteError {
    RouteError::Coordinator("coordinator actor unavailable".to_string())
}

fn reply_error<M>(error: SendError<M, RouteError>) -> RouteError {
    match error {
        SendError::HandlerError(e) => e,
        _ => unavailable(),
    }
}

impl CoordinatorHandle {
    pub fn actor_ref(&self) -> &ActorRef<MigrationCoordinator> {
        &self.actor
    }

    pub async fn start_migration_plan(&self, request: StartMigrationPlan) -> Result<MigrationStatus> {
        self.actor.ask(request).await.map_err(reply_error)
    }

    pub async fn get_current_status(&self) -> Result<MigrationStatus> {
        self.actor.ask(GetCurrentStatus).await.map_err(reply_error)
    }

    pub async fn continue_migration_plan(&self) -> Result<MigrationStatus> {
        self.actor.ask(ContinueMigrationPlan).await.map_err(reply_error)
    }

    pub async fn stop(&self) -> Result<StopAck> {
        self.actor.ask(StopCoordinator).await.map_err(|_| unavailable())
    }

    pub async fn is_stopped(&self) -> Result<bool> {
        let status = self.actor.ask(IsStopped).await.map_err(|_| unavailable())?;
        Ok(status.stopped)
    }

    pub async fn clean_all(&self) -> Result<MigrationStatus> {
        self.actor.ask(CleanAll).await.map_err(reply_error)
    }
}

/// Spawn the coordinator actor on the current runtime.
pub fn spawn_migration_coordinator(coordinator: MigrationCoordinator) -> CoordinatorHandle {
    CoordinatorHandle {
        actor: MigrationCoordinator::spawn(coordinator),
    }
}
