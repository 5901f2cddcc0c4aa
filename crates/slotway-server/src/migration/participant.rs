//! Migration Participant
//!
//! One per service. Polls the migration record and, while a plan is
//! transferring, launches this service's input task (when it receives slots)
//! and output task (when it releases slots). Each task runs under a restart
//! policy; once the policy is exhausted the task's progress is marked FAILED
//! and the coordinator fails the plan.
//!
//! When a plan fails, a destination stops its input task and discards the
//! copies it received.

use super::{refresh_record, MigrationContext, MigrationInputTask, MigrationOutputTask};
use crate::cache::VersionedCache;
use crate::entity::EntityStore;
use crate::observability::{events, ErrorLogLimiter, RestartPolicy, RestartTracker};
use crate::store::update_migration;
use chrono::Utc;
use slotway_core::{MigrationRecord, MigrationState, ProgressStatus, Result, RouteError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Role {
    Input,
    Output,
    Discard,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::Input => "input",
            Role::Output => "output",
            Role::Discard => "discard",
        }
    }
}

pub struct MigrationParticipant {
    service: String,
    ctx: MigrationContext,
    entities: Arc<dyn EntityStore>,
    policy: RestartPolicy,
    record: VersionedCache<MigrationRecord>,
    /// Supervised task per role, tagged with the plan it serves
    tasks: BTreeMap<Role, (Uuid, JoinHandle<()>)>,
}

impl MigrationParticipant {
    pub fn new(service: impl Into<String>, ctx: MigrationContext, entities: Arc<dyn EntityStore>) -> Self {
        Self {
            service: service.into(),
            ctx,
            entities,
            policy: RestartPolicy::default(),
            record: VersionedCache::new(),
            tasks: BTreeMap::new(),
        }
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Poll until `stop` flips to true; running tasks are aborted on exit and
    /// resume from persisted progress on the next start.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(service = %self.service, "Migration participant started");
        let mut limiter = ErrorLogLimiter::new(self.ctx.config.error_log_interval);

        loop {
            if *stop.borrow_and_update() {
                break;
            }
            if let Err(e) = self.tick().await {
                if let Some(suppressed) = limiter.admit("participant_tick") {
                    warn!(service = %self.service, error = %e, suppressed = suppressed, "Migration participant poll failed");
                }
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
            }
        }

        for (_, (_, task)) in std::mem::take(&mut self.tasks) {
            task.abort();
        }
        info!(service = %self.service, "Migration participant stopped");
    }

    async fn tick(&mut self) -> Result<()> {
        let Some(record) = refresh_record(self.ctx.store.as_ref(), &self.record).await? else {
            return Ok(());
        };
        if record.state == MigrationState::Failed {
            if record.progress.get(&self.service).is_some_and(|p| !p.discarded) {
                if let Some((_, input)) = self.tasks.remove(&Role::Input) {
                    input.abort();
                }
                self.launch(Role::Discard, record.plan.id);
            }
            return Ok(());
        }
        if !record.state.is_transferring() {
            return Ok(());
        }

        let receives = record
            .progress
            .get(&self.service)
            .is_some_and(|p| matches!(p.status, ProgressStatus::Pending | ProgressStatus::Running));
        if receives {
            self.launch(Role::Input, record.plan.id);
        }

        let releases = record
            .outputs
            .get(&self.service)
            .is_some_and(|o| o.status != ProgressStatus::Failed && !o.cleaned);
        if releases {
            self.launch(Role::Output, record.plan.id);
        }
        Ok(())
    }

    /// Start the supervised task for `role` unless one already serves `plan_id`.
    fn launch(&mut self, role: Role, plan_id: Uuid) {
        if self.tasks.get(&role).is_some_and(|(id, _)| *id == plan_id) {
            return;
        }
        info!(service = %self.service, role = role.as_str(), plan_id = %plan_id, "Launching migration task");
        let task = tokio::spawn(supervise(
            role,
            self.service.clone(),
            plan_id,
            self.ctx.clone(),
            self.entities.clone(),
            self.policy.clone(),
        ));
        if let Some((_, previous)) = self.tasks.insert(role, (plan_id, task)) {
            previous.abort();
        }
    }
}

async fn supervise(
    role: Role,
    service: String,
    plan_id: Uuid,
    ctx: MigrationContext,
    entities: Arc<dyn EntityStore>,
    policy: RestartPolicy,
) {
    let mut tracker = RestartTracker::new(policy);
    loop {
        let result = match role {
            Role::Input => {
                MigrationInputTask::new(ctx.clone(), service.clone(), plan_id, entities.clone())
                    .run()
                    .await
            }
            Role::Output => {
                MigrationOutputTask::new(ctx.clone(), service.clone(), plan_id, entities.clone())
                    .run()
                    .await
            }
            Role::Discard => {
                MigrationInputTask::new(ctx.clone(), service.clone(), plan_id, entities.clone())
                    .discard()
                    .await
            }
        };
        let error = match result {
            Ok(()) => return,
            Err(e) => e,
        };

        match tracker.record_failure() {
            Some(backoff) => {
                warn!(
                    service = %service,
                    role = role.as_str(),
                    error = %error,
                    restarts = tracker.restart_count(),
                    backoff_ms = backoff.as_millis() as u64,
                    "Migration task failed, restarting"
                );
                tokio::time::sleep(backoff).await;
            }
            None => {
                events::migration_task_failed(&service, role.as_str(), &error.to_string(), tracker.restart_count());
                if role == Role::Discard {
                    return;
                }
                if let Err(e) = mark_failed(&ctx, role, &service, plan_id).await {
                    error!(service = %service, role = role.as_str(), error = %e, "Could not record task failure");
                }
                return;
            }
        }
    }
}

async fn mark_failed(ctx: &MigrationContext, role: Role, service: &str, plan_id: Uuid) -> Result<(), RouteError> {
    let service = service.to_string();
    update_migration(ctx.store.as_ref(), move |r| {
        if r.plan.id != plan_id {
            return false;
        }
        let status = match role {
            Role::Input => r.progress.get_mut(&service).map(|p| (&mut p.status, &mut p.end_time)),
            Role::Output => r.outputs.get_mut(&service).map(|o| (&mut o.status, &mut o.end_time)),
            Role::Discard => None,
        };
        match status {
            Some((status, end_time)) => {
                *status = ProgressStatus::Failed;
                *end_time = Some(Utc::now());
                true
            }
            None => false,
        }
    })
    .await?;
    Ok(())
}

/// Control handle of a spawned participant.
pub struct ParticipantHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ParticipantHandle {
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop and wait for the loop to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Migration participant task ended abnormally");
        }
    }
}

/// Spawn a participant as a background task.
pub fn spawn_migration_participant(participant: MigrationParticipant) -> ParticipantHandle {
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(participant.run(stop_rx));
    ParticipantHandle { stop, task }
}
