//! Coordinator Driver
//!
//! Background loop that advances the persisted plan:
//!
//! ```text
//! PLANNING ──▶ TRANSFERRING ──all markers──▶ VERIFYING ──quiet period──▶ CUTOVER ──sources cleaned──▶ DONE
//!                   │                            │                          │
//!                   └──── task failed ───────────┴──── count decreased ─────┴──▶ FAILED
//! ```
//!
//! Every step re-reads the record, so a restarted driver picks up where the
//! previous one stopped.

use crate::migration::MigrationContext;
use crate::observability::{events, metrics, ErrorLogLimiter};
use crate::store::update_migration;
use slotway_core::{MigrationPlan, MigrationRecord, MigrationState, ProgressStatus, Result, RouteError};
use std::collections::BTreeMap;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

enum Step {
    Pending,
    Finished(MigrationState),
}

pub(super) struct CoordinatorDriver {
    ctx: MigrationContext,
    /// Received counts last seen in VERIFYING and when they last changed
    quiet: Option<(BTreeMap<String, u64>, Instant)>,
    cutover_reported: bool,
}

impl CoordinatorDriver {
    pub(super) fn new(ctx: MigrationContext) -> Self {
        Self {
            ctx,
            quiet: None,
            cutover_reported: false,
        }
    }

    pub(super) async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!("Migration driver started");
        let mut limiter = ErrorLogLimiter::new(self.ctx.config.error_log_interval);

        loop {
            if *stop.borrow_and_update() {
                info!("Migration driver stopped on request");
                return;
            }
            match self.step().await {
                Ok(Step::Pending) => {}
                Ok(Step::Finished(state)) => {
                    info!(state = %state, "Migration driver finished");
                    return;
                }
                Err(e) if e.is_retryable() => {
                    if let Some(suppressed) = limiter.admit("driver_step") {
                        warn!(error = %e, suppressed = suppressed, "Migration step failed, retrying");
                    }
                }
                Err(e) => {
                    error!(code = e.code(), error = %e, "Migration driver stopped");
                    return;
                }
            }
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = tokio::time::sleep(self.ctx.config.poll_interval) => {}
            }
        }
    }

    async fn step(&mut self) -> Result<Step> {
        let record = self
            .ctx
            .store
            .load_migration()
            .await?
            .ok_or(RouteError::NotFound)?;
        metrics::set_migration_state(record.state);

        match record.state {
            MigrationState::Idle => Ok(Step::Pending),
            MigrationState::Planning => {
                let next = if record.plan.slot_diff.is_empty() {
                    MigrationState::Done
                } else {
                    MigrationState::Transferring
                };
                self.advance(&record, next).await?;
                Ok(Step::Pending)
            }
            MigrationState::Transferring => self.check_transfer(&record).await,
            MigrationState::Verifying => self.verify(&record).await,
            MigrationState::Cutover => self.cutover(&record).await,
            MigrationState::Done | MigrationState::Failed => Ok(Step::Finished(record.state)),
        }
    }

    async fn check_transfer(&mut self, record: &MigrationRecord) -> Result<Step> {
        if let Some(reason) = failed_task(record) {
            return self.fail(record, reason).await;
        }
        if record.progress.values().all(|p| p.all_markers_seen()) {
            self.quiet = None;
            self.advance(record, MigrationState::Verifying).await?;
        }
        Ok(Step::Pending)
    }

    /// Received counts must stay unchanged for a full quiet period.
    async fn verify(&mut self, record: &MigrationRecord) -> Result<Step> {
        if let Some(reason) = failed_task(record) {
            return self.fail(record, reason).await;
        }
        let counts = record.received_counts();

        let Some((previous, since)) = self.quiet.clone() else {
            self.quiet = Some((counts, Instant::now()));
            return Ok(Step::Pending);
        };
        let decreased = counts
            .iter()
            .find(|(target, count)| previous.get(*target).is_some_and(|p| *count < p))
            .map(|(target, _)| target.clone());
        if let Some(target) = decreased {
            return self
                .fail(record, format!("received count of {target} decreased during verification"))
                .await;
        }

        if counts != previous {
            debug!("Received counts still moving, restarting quiet period");
            self.quiet = Some((counts, Instant::now()));
        } else if since.elapsed() >= self.ctx.config.quiet_period {
            self.advance(record, MigrationState::Cutover).await?;
        }
        Ok(Step::Pending)
    }

    /// Apply the moves to the slot table, then wait for every source to
    /// clean up before finishing.
    async fn cutover(&mut self, record: &MigrationRecord) -> Result<Step> {
        let table = self.ctx.slots.apply_moves(&record.plan.slot_diff).await?;
        if !self.cutover_reported {
            events::cutover_applied(&record.plan.id.to_string(), record.plan.slot_diff.len(), table.version);
            self.cutover_reported = true;
        }

        if !record.outputs.values().all(|o| o.cleaned) {
            return Ok(Step::Pending);
        }
        let done = self.advance(record, MigrationState::Done).await?;
        if done.state != MigrationState::Done {
            return Ok(Step::Pending);
        }
        self.release_channels(&done.plan).await;
        Ok(Step::Finished(MigrationState::Done))
    }

    async fn advance(&mut self, record: &MigrationRecord, next: MigrationState) -> Result<MigrationRecord> {
        let (plan_id, from) = (record.plan.id, record.state);
        let updated = update_migration(self.ctx.store.as_ref(), move |r| {
            r.plan.id == plan_id && r.state == from && r.transition(next)
        })
        .await?;
        if updated.state == next {
            events::migration_state_changed(&plan_id.to_string(), from.as_str(), next.as_str());
            metrics::set_migration_state(next);
        }
        Ok(updated)
    }

    async fn fail(&mut self, record: &MigrationRecord, reason: String) -> Result<Step> {
        let plan_id = record.plan.id;
        let failure = reason.clone();
        let updated = update_migration(self.ctx.store.as_ref(), move |r| {
            r.plan.id == plan_id && r.fail(failure.clone())
        })
        .await?;
        if updated.state == MigrationState::Failed {
            events::migration_failed(&plan_id.to_string(), &reason);
            metrics::set_migration_state(MigrationState::Failed);
        }
        Ok(Step::Finished(updated.state))
    }

    async fn release_channels(&self, plan: &MigrationPlan) {
        for target in plan.destinations() {
            let input = plan.input_channel(&target).name;
            let output = plan.output_channel(&target).name;
            let mut names = vec![input];
            if !names.contains(&output) {
                names.push(output);
            }
            for name in names {
                if let Err(e) = self.ctx.buses.release(&plan.bus_kind, &name).await {
                    warn!(channel = %name, error = %e, "Failed to release migration channel");
                }
            }
        }
    }
}

/// First input or output task that gave up, if any.
fn failed_task(record: &MigrationRecord) -> Option<String> {
    if let Some(p) = record.progress.values().find(|p| p.status == ProgressStatus::Failed) {
        return Some(format!("input task of {} failed", p.target_service));
    }
    record
        .outputs
        .values()
        .find(|o| o.status == ProgressStatus::Failed)
        .map(|o| format!("output task of {} failed", o.source_service))
}
