//! Migration Input Task
//!
//! Runs on a destination service and consumes its migration channel
//! `<base>.<target>`. Entities are deduplicated by key within a read batch,
//! persisted with `batch_save`, and counted; a slot's completion marker is
//! recorded only after every entity written before it has been saved. The
//! progress update is persisted before the batch is acknowledged.
//!
//! Only entities `batch_save` actually wrote are counted, so a redelivered
//! batch leaves the received count unchanged.
//!
//! If the plan fails, [`MigrationInputTask::discard`] removes the copies this
//! destination received; the source never gave those slots up.

use super::{remove_slot_entities, MigrationContext};
use crate::entity::EntityStore;
use crate::observability::{events, metrics, ErrorLogLimiter};
use crate::store::update_migration;
use chrono::Utc;
use slotway_core::{BusMessage, MigrationState, ProgressStatus, Result, RouteError, Slot, StatefulEntity};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of one consumed batch.
#[derive(Debug, Default)]
struct BatchOutcome {
    received: u64,
    markers: BTreeSet<Slot>,
}

pub struct MigrationInputTask {
    ctx: MigrationContext,
    target: String,
    plan_id: Uuid,
    entities: Arc<dyn EntityStore>,
}

impl MigrationInputTask {
    pub fn new(ctx: MigrationContext, target: impl Into<String>, plan_id: Uuid, entities: Arc<dyn EntityStore>) -> Self {
        Self {
            ctx,
            target: target.into(),
            plan_id,
            entities,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let Some(record) = self.ctx.store.load_migration().await? else {
            return Ok(());
        };
        if record.plan.id != self.plan_id {
            return Ok(());
        }
        let Some(progress) = record.progress.get(&self.target).cloned() else {
            return Ok(());
        };
        if progress.status == ProgressStatus::Finished {
            return Ok(());
        }

        let (plan_id, target) = (self.plan_id, self.target.clone());
        update_migration(self.ctx.store.as_ref(), move |r| {
            if r.plan.id != plan_id {
                return false;
            }
            match r.progress.get_mut(&target) {
                Some(p) if p.status == ProgressStatus::Pending => {
                    p.status = ProgressStatus::Running;
                    p.begin_time = Some(Utc::now());
                    true
                }
                _ => false,
            }
        })
        .await?;

        let channel = self
            .ctx
            .buses
            .open(&record.plan.bus_kind, &record.plan.input_channel(&self.target))
            .await
            .map_err(RouteError::InitInputBus)?;
        info!(
            target = %self.target,
            channel = %channel.name(),
            slots = progress.slots.len(),
            finished = progress.finished_slots.len(),
            "Migration input started"
        );

        let mut limiter = ErrorLogLimiter::new(self.ctx.config.error_log_interval);
        let mut finished = progress.finished_slots.clone();
        let mut received = progress.received_count;

        while !progress.slots.is_subset(&finished) {
            let batch = match channel.read(self.ctx.config.max_fetch).await {
                Ok(batch) => batch,
                Err(e) => {
                    let error = RouteError::from(e);
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    if let Some(suppressed) = limiter.admit("input_read") {
                        warn!(target = %self.target, error = %error, suppressed = suppressed, "Migration read failed, retrying");
                    }
                    tokio::time::sleep(self.ctx.config.retry_delay).await;
                    continue;
                }
            };
            if batch.is_empty() {
                if self.plan_ended().await? {
                    return Ok(());
                }
                continue;
            }

            let outcome = self.apply_batch(batch, &progress.slots, &finished).await?;
            self.save_progress(&outcome).await?;
            if let Err(e) = channel.ack().await {
                // Unacknowledged messages are redelivered; saves are idempotent.
                warn!(target = %self.target, error = %e, "Migration batch ack failed");
            }

            received += outcome.received;
            for slot in &outcome.markers {
                finished.insert(*slot);
                events::slot_transfer_finished(&self.target, *slot, finished.len(), progress.expected_markers);
            }
        }

        events::input_task_finished(&self.target, received, progress.slots.len());
        Ok(())
    }

    async fn apply_batch(
        &self,
        batch: Vec<BusMessage>,
        slots: &BTreeSet<Slot>,
        finished: &BTreeSet<Slot>,
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut pending: BTreeMap<String, StatefulEntity> = BTreeMap::new();

        for message in batch {
            match message {
                BusMessage::MigrateEntity {
                    target, slot, entity, ..
                } => {
                    if target != self.target || !slots.contains(&slot) {
                        warn!(
                            target = %self.target,
                            message_target = %target,
                            slot = slot,
                            "Skipping entity addressed to another transfer"
                        );
                        continue;
                    }
                    let newer = pending
                        .get(&entity.key)
                        .map_or(true, |existing| entity.revision >= existing.revision);
                    if newer {
                        pending.insert(entity.key.clone(), entity);
                    }
                    if pending.len() >= self.ctx.config.batch_size {
                        outcome.received += self.flush(&mut pending).await?;
                    }
                }
                BusMessage::SlotFinished {
                    source, target, slot, sent,
                } => {
                    if target != self.target || !slots.contains(&slot) {
                        warn!(target = %self.target, slot = slot, "Skipping marker addressed to another transfer");
                        continue;
                    }
                    if finished.contains(&slot) || outcome.markers.contains(&slot) {
                        debug!(target = %self.target, slot = slot, "Duplicate slot marker");
                        continue;
                    }
                    outcome.received += self.flush(&mut pending).await?;
                    debug!(source = %source, target = %self.target, slot = slot, sent = sent, "Slot marker received");
                    outcome.markers.insert(slot);
                }
                other => {
                    debug!(target = %self.target, kind = other.kind(), "Ignoring message on migration channel");
                }
            }
        }
        outcome.received += self.flush(&mut pending).await?;
        Ok(outcome)
    }

    async fn flush(&self, pending: &mut BTreeMap<String, StatefulEntity>) -> Result<u64> {
        if pending.is_empty() {
            return Ok(0);
        }
        let batch: Vec<StatefulEntity> = std::mem::take(pending).into_values().collect();
        let written = self.entities.batch_save(batch).await?;
        metrics::record_entities_received(&self.target, written);
        Ok(written as u64)
    }

    async fn save_progress(&self, outcome: &BatchOutcome) -> Result<()> {
        if outcome.received == 0 && outcome.markers.is_empty() {
            return Ok(());
        }
        let (plan_id, target) = (self.plan_id, self.target.clone());
        let (received, markers) = (outcome.received, outcome.markers.clone());
        update_migration(self.ctx.store.as_ref(), move |r| {
            if r.plan.id != plan_id {
                return false;
            }
            let Some(p) = r.progress.get_mut(&target) else {
                return false;
            };
            p.received_count += received;
            p.finished_slots.extend(markers.iter().copied());
            if p.all_markers_seen() && p.status != ProgressStatus::Finished {
                p.status = ProgressStatus::Finished;
                p.end_time = Some(Utc::now());
            }
            true
        })
        .await?;
        Ok(())
    }

    /// Remove the entities received for a failed plan and mark the progress
    /// discarded.
    pub async fn discard(&self) -> Result<()> {
        let Some(record) = self.ctx.store.load_migration().await? else {
            return Ok(());
        };
        if record.plan.id != self.plan_id || record.state != MigrationState::Failed {
            return Ok(());
        }
        let Some(progress) = record.progress.get(&self.target) else {
            return Ok(());
        };
        if progress.discarded {
            return Ok(());
        }

        let removed = remove_slot_entities(
            self.entities.as_ref(),
            record.plan.total_slots,
            &progress.slots,
            self.ctx.config.scan_page_size,
        )
        .await?;

        let (plan_id, target) = (self.plan_id, self.target.clone());
        update_migration(self.ctx.store.as_ref(), move |r| {
            if r.plan.id != plan_id {
                return false;
            }
            match r.progress.get_mut(&target) {
                Some(p) if !p.discarded => {
                    p.discarded = true;
                    true
                }
                _ => false,
            }
        })
        .await?;
        events::transfer_discarded(&self.target, &self.plan_id.to_string(), removed);
        Ok(())
    }

    /// The plan failed or was replaced while this task was waiting.
    async fn plan_ended(&self) -> Result<bool> {
        Ok(match self.ctx.store.load_migration().await? {
            Some(record) => record.plan.id != self.plan_id || record.state == MigrationState::Failed,
            None => true,
        })
    }
}
