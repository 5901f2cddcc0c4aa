//! Migration Output Task
//!
//! Runs on a source service. Streams every local entity of the released slots
//! to the destination's migration channel, then writes one completion marker
//! per slot. After cutover it deletes the transferred entities.
//!
//! The scan starts only once the source's ownership gate has acknowledged
//! the plan: from then on no live message for a released slot is applied
//! locally, so every write is either in the scan or forwarded.
//!
//! The scan cursor and per-slot counts are persisted after each page, so a
//! restarted task resumes after the last page it wrote.

use super::{remove_slot_entities, MigrationContext};
use crate::bus::MessageBus;
use crate::entity::EntityStore;
use crate::observability::{events, metrics, ErrorLogLimiter};
use crate::store::update_migration;
use chrono::Utc;
use slotway_core::{
    BusMessage, MigrationPlan, MigrationRecord, MigrationState, OutputProgress, ProgressStatus, Result, RouteError,
    Slot,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct MigrationOutputTask {
    ctx: MigrationContext,
    source: String,
    plan_id: Uuid,
    entities: Arc<dyn EntityStore>,
}

impl MigrationOutputTask {
    pub fn new(ctx: MigrationContext, source: impl Into<String>, plan_id: Uuid, entities: Arc<dyn EntityStore>) -> Self {
        Self {
            ctx,
            source: source.into(),
            plan_id,
            entities,
        }
    }

    /// Transfer, wait for cutover, clean up. Safe to call again after a failure.
    pub async fn run(&self) -> Result<()> {
        let Some((record, output)) = self.current().await? else {
            return Ok(());
        };
        if output.status != ProgressStatus::Finished {
            self.mark_running().await?;
            let Some(output) = self.wait_for_gate().await? else {
                return Ok(());
            };
            self.transfer(&record.plan, &output).await?;
        }
        self.clean_after_cutover().await
    }

    /// Record and this source's progress, unless the plan was replaced.
    async fn current(&self) -> Result<Option<(MigrationRecord, OutputProgress)>> {
        let Some(record) = self.ctx.store.load_migration().await? else {
            return Ok(None);
        };
        if record.plan.id != self.plan_id {
            return Ok(None);
        }
        let output = record.outputs.get(&self.source).cloned();
        Ok(output.map(|output| (record, output)))
    }

    async fn mark_running(&self) -> Result<()> {
        let (plan_id, source) = (self.plan_id, self.source.clone());
        update_migration(self.ctx.store.as_ref(), move |r| {
            if r.plan.id != plan_id {
                return false;
            }
            match r.outputs.get_mut(&source) {
                Some(output) if output.status == ProgressStatus::Pending => {
                    output.status = ProgressStatus::Running;
                    output.begin_time = Some(Utc::now());
                    true
                }
                _ => false,
            }
        })
        .await?;
        Ok(())
    }

    /// Wait until this source's gate redirects every released slot. Returns
    /// the current progress, or `None` when the plan ended first.
    async fn wait_for_gate(&self) -> Result<Option<OutputProgress>> {
        let mut limiter = ErrorLogLimiter::new(self.ctx.config.error_log_interval);
        loop {
            let Some((record, output)) = self.current().await? else {
                return Ok(None);
            };
            if output.gate_ready {
                return Ok(Some(output));
            }
            if record.state != MigrationState::Transferring {
                debug!(source = %self.source, state = %record.state, "Plan moved on before the gate acknowledged");
                return Ok(None);
            }
            if let Some(suppressed) = limiter.admit("gate_wait") {
                info!(source = %self.source, suppressed = suppressed, "Waiting for the ownership gate before scanning");
            }
            tokio::time::sleep(self.ctx.config.poll_interval).await;
        }
    }

    async fn transfer(&self, plan: &MigrationPlan, output: &OutputProgress) -> Result<()> {
        let mut channels: BTreeMap<String, Arc<dyn MessageBus>> = BTreeMap::new();
        for target in output.slots.values() {
            if channels.contains_key(target) {
                continue;
            }
            let bus = self
                .ctx
                .buses
                .open(&plan.bus_kind, &plan.output_channel(target))
                .await
                .map_err(RouteError::InitOutputBus)?;
            channels.insert(target.clone(), bus);
        }

        let mut limiter = ErrorLogLimiter::new(self.ctx.config.error_log_interval);
        let mut cursor = output.cursor.clone();
        let mut sent_per_slot = output.sent_per_slot.clone();
        info!(
            source = %self.source,
            slots = output.slots.len(),
            destinations = channels.len(),
            resume_after = ?cursor,
            "Migration output started"
        );

        loop {
            let page = self
                .entities
                .scan(cursor.as_deref(), self.ctx.config.scan_page_size)
                .await?;
            let Some(last_key) = page.last().map(|e| e.key.clone()) else {
                break;
            };

            let mut outbound: BTreeMap<&str, Vec<BusMessage>> = BTreeMap::new();
            let mut page_counts: BTreeMap<Slot, u64> = BTreeMap::new();
            for entity in page {
                let slot = entity.slot(plan.total_slots);
                let Some(target) = output.slots.get(&slot) else {
                    continue;
                };
                *page_counts.entry(slot).or_default() += 1;
                outbound.entry(target.as_str()).or_default().push(BusMessage::MigrateEntity {
                    source: self.source.clone(),
                    target: target.clone(),
                    slot,
                    entity,
                });
            }

            let mut sent = 0;
            for (target, messages) in outbound {
                if let Some(bus) = channels.get(target) {
                    sent += messages.len();
                    self.write_with_retry(bus.as_ref(), messages, &mut limiter).await?;
                }
            }
            for (slot, count) in page_counts {
                *sent_per_slot.entry(slot).or_default() += count;
            }
            self.save_cursor(&last_key, &sent_per_slot).await?;
            metrics::record_entities_sent(&self.source, sent);
            debug!(source = %self.source, cursor = %last_key, sent = sent, "Migration page written");
            cursor = Some(last_key);
        }

        let mut markers: BTreeMap<&str, Vec<BusMessage>> = BTreeMap::new();
        for (slot, target) in &output.slots {
            markers.entry(target.as_str()).or_default().push(BusMessage::SlotFinished {
                source: self.source.clone(),
                target: target.clone(),
                slot: *slot,
                sent: sent_per_slot.get(slot).copied().unwrap_or(0),
            });
        }
        for (target, messages) in markers {
            if let Some(bus) = channels.get(target) {
                self.write_with_retry(bus.as_ref(), messages, &mut limiter).await?;
            }
        }

        let (plan_id, source) = (self.plan_id, self.source.clone());
        update_migration(self.ctx.store.as_ref(), move |r| {
            if r.plan.id != plan_id {
                return false;
            }
            match r.outputs.get_mut(&source) {
                Some(output) if output.status != ProgressStatus::Finished => {
                    output.status = ProgressStatus::Finished;
                    output.end_time = Some(Utc::now());
                    true
                }
                _ => false,
            }
        })
        .await?;

        let total: u64 = sent_per_slot.values().sum();
        events::output_task_finished(&self.source, total, output.slots.len());
        Ok(())
    }

    async fn save_cursor(&self, cursor: &str, sent_per_slot: &BTreeMap<Slot, u64>) -> Result<()> {
        let (plan_id, source) = (self.plan_id, self.source.clone());
        let (cursor, sent_per_slot) = (cursor.to_string(), sent_per_slot.clone());
        update_migration(self.ctx.store.as_ref(), move |r| {
            if r.plan.id != plan_id {
                return false;
            }
            match r.outputs.get_mut(&source) {
                Some(output) => {
                    output.cursor = Some(cursor.clone());
                    output.sent_per_slot = sent_per_slot.clone();
                    true
                }
                None => false,
            }
        })
        .await?;
        Ok(())
    }

    /// Transport failures are retried in place; the scan position is not
    /// advanced until the write went through.
    async fn write_with_retry(
        &self,
        bus: &dyn MessageBus,
        messages: Vec<BusMessage>,
        limiter: &mut ErrorLogLimiter,
    ) -> Result<()> {
        loop {
            match bus.write_batch(messages.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let error = RouteError::from(e);
                    if !error.is_retryable() {
                        return Err(error);
                    }
                    if let Some(suppressed) = limiter.admit("output_write") {
                        warn!(
                            source = %self.source,
                            bus = %bus.name(),
                            error = %error,
                            suppressed = suppressed,
                            "Migration write failed, retrying"
                        );
                    }
                    tokio::time::sleep(self.ctx.config.retry_delay).await;
                }
            }
        }
    }

    /// Wait for CUTOVER, then delete the entities of the released slots.
    async fn clean_after_cutover(&self) -> Result<()> {
        let (total_slots, output) = loop {
            let Some((record, output)) = self.current().await? else {
                return Ok(());
            };
            if output.cleaned {
                return Ok(());
            }
            match record.state {
                MigrationState::Cutover => break (record.plan.total_slots, output),
                MigrationState::Failed | MigrationState::Done => {
                    debug!(source = %self.source, state = %record.state, "Plan ended before cleanup");
                    return Ok(());
                }
                _ => tokio::time::sleep(self.ctx.config.poll_interval).await,
            }
        };

        let released: BTreeSet<Slot> = output.slots.keys().copied().collect();
        let removed = remove_slot_entities(
            self.entities.as_ref(),
            total_slots,
            &released,
            self.ctx.config.scan_page_size,
        )
        .await?;

        let (plan_id, source) = (self.plan_id, self.source.clone());
        update_migration(self.ctx.store.as_ref(), move |r| {
            if r.plan.id != plan_id {
                return false;
            }
            match r.outputs.get_mut(&source) {
                Some(output) if !output.cleaned => {
                    output.cleaned = true;
                    true
                }
                _ => false,
            }
        })
        .await?;
        info!(source = %self.source, removed = removed, "Transferred entities removed from source");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusFactory;
    use crate::config::MigrationConfig;
    use crate::entity::MemoryEntityStore;
    use crate::slots::SlotsManager;
    use crate::store::{MemoryMetaStore, MetaStore};
    use serde_json::json;
    use slotway_core::{slot_for_key, BusConfig, SlotMove, StatefulEntity};
    use std::time::Duration;

    struct Fixture {
        ctx: MigrationContext,
        entities: Arc<MemoryEntityStore>,
        plan: MigrationPlan,
    }

    impl Fixture {
        /// Slot 1 moves from `a` to `b`; `a` holds entities of slots 0 and 1.
        async fn new(prepare: impl FnOnce(&mut OutputProgress)) -> Self {
            let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
            let slots = Arc::new(SlotsManager::new(store.clone()));
            let config = MigrationConfig {
                poll_interval: Duration::from_millis(5),
                scan_page_size: 2,
                retry_delay: Duration::from_millis(5),
                ..MigrationConfig::default()
            };
            let buses = Arc::new(BusFactory::with_memory(Duration::from_millis(5)));
            let plan = MigrationPlan {
                id: Uuid::new_v4(),
                total_slots: 4,
                bus_kind: "memory".into(),
                input_bus: BusConfig::named("migration"),
                output_bus: BusConfig::named("migration"),
                source_distribution: [("a".to_string(), 2), ("b".to_string(), 2)].into_iter().collect(),
                target_distribution: [("a".to_string(), 1), ("b".to_string(), 3)].into_iter().collect(),
                slot_diff: vec![SlotMove {
                    slot: 1,
                    from: "a".into(),
                    to: "b".into(),
                }],
                initiated_by: "test".into(),
                started_at: Utc::now(),
            };
            let mut record = MigrationRecord::new(plan.clone());
            record.transition(MigrationState::Transferring);
            if let Some(output) = record.outputs.get_mut("a") {
                prepare(output);
            }
            store.create_migration(&record).await.unwrap();

            let entities = Arc::new(MemoryEntityStore::new());
            for key in keys_in_slot(1, 6).into_iter().chain(keys_in_slot(0, 2)) {
                entities.save(StatefulEntity::new(key, json!({}))).await.unwrap();
            }

            Self {
                ctx: MigrationContext::new(store, slots, buses, config),
                entities,
                plan,
            }
        }

        fn spawn(&self) -> tokio::task::JoinHandle<Result<()>> {
            let task = MigrationOutputTask::new(self.ctx.clone(), "a", self.plan.id, self.entities.clone());
            tokio::spawn(async move { task.run().await })
        }

        async fn output(&self) -> OutputProgress {
            self.ctx.store.load_migration().await.unwrap().unwrap().outputs["a"].clone()
        }

        async fn wait_finished(&self) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.output().await.status != ProgressStatus::Finished {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }

        async fn drain_channel(&self) -> Vec<BusMessage> {
            let channel = self
                .ctx
                .buses
                .open("memory", &self.plan.input_channel("b"))
                .await
                .unwrap();
            let batch = channel.read(100).await.unwrap();
            channel.ack().await.unwrap();
            batch
        }

        async fn advance(&self, state: MigrationState) {
            update_migration(self.ctx.store.as_ref(), |r| r.transition(state))
                .await
                .unwrap();
        }
    }

    fn keys_in_slot(slot: Slot, count: usize) -> Vec<String> {
        let mut keys: Vec<String> = (0..)
            .map(|i| format!("thread-{i}"))
            .filter(|key| slot_for_key(key, 4) == slot)
            .take(count)
            .collect();
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_resumes_after_saved_cursor() {
        let moving = keys_in_slot(1, 6);
        let f = Fixture::new(|output| {
            output.status = ProgressStatus::Running;
            output.gate_ready = true;
            output.cursor = Some(moving[2].clone());
            output.sent_per_slot = [(1, 3)].into_iter().collect();
        })
        .await;

        let task = f.spawn();
        f.wait_finished().await;
        f.advance(MigrationState::Failed).await;
        task.await.unwrap().unwrap();

        let messages = f.drain_channel().await;
        let (marker, streamed) = messages.split_last().unwrap();
        let keys: Vec<&str> = streamed.iter().filter_map(BusMessage::routing_key).collect();
        assert_eq!(keys, moving[3..].iter().map(String::as_str).collect::<Vec<_>>());
        assert_eq!(
            marker,
            &BusMessage::SlotFinished {
                source: "a".into(),
                target: "b".into(),
                slot: 1,
                sent: 6,
            }
        );
        assert_eq!(f.output().await.sent_count(), 6);
    }

    #[tokio::test]
    async fn test_scan_waits_for_gate_then_cleans_after_cutover() {
        let f = Fixture::new(|_| {}).await;
        let task = f.spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let output = f.output().await;
        assert_eq!(output.status, ProgressStatus::Running);
        assert_eq!(output.cursor, None);
        assert!(f.drain_channel().await.is_empty());

        update_migration(f.ctx.store.as_ref(), |r| match r.outputs.get_mut("a") {
            Some(output) => {
                output.gate_ready = true;
                true
            }
            None => false,
        })
        .await
        .unwrap();
        f.wait_finished().await;
        assert_eq!(f.drain_channel().await.len(), 7);

        f.advance(MigrationState::Verifying).await;
        f.advance(MigrationState::Cutover).await;
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(f.entities.keys(), keys_in_slot(0, 2));
        assert!(f.output().await.cleaned);
    }
}
