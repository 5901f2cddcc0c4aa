//! End-to-end migration scenarios on the in-memory store and buses.

use super::*;
use crate::bus::{BusRegistry, MemoryBusProvider, MemoryMessageBus, MessageBus};
use crate::config::{MigrationConfig, RouteConfig};
use crate::entity::{EntityStore, MemoryEntityStore};
use crate::observability::RestartPolicy;
use crate::route::{spawn_message_route, AttributeKeyStrategy, MessageRoute, RouteHandle, ServiceDirectory};
use crate::store::MemoryMetaStore;
use crate::worker::{spawn_service_worker, EntityRecorder, ServiceWorker, WorkerHandle};
use async_trait::async_trait;
use serde_json::json;
use slotway_core::{
    BusConfig, BusMessage, EventMessage, MigrationRecord, MigrationState, MigrationStatus, ProgressStatus, RouteError,
    SlotTable,
    StatefulEntity,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const POLL: Duration = Duration::from_millis(5);

fn config() -> MigrationConfig {
    MigrationConfig {
        poll_interval: Duration::from_millis(10),
        scan_page_size: 50,
        batch_size: 64,
        max_fetch: 128,
        quiet_period: Duration::from_millis(50),
        retry_delay: POLL,
        error_log_interval: Duration::from_secs(1),
    }
}

fn route_config() -> RouteConfig {
    RouteConfig {
        max_fetch: 256,
        poll_timeout: POLL,
        retry_delay: POLL,
        ..RouteConfig::default()
    }
}

fn distribution(pairs: &[(&str, u32)]) -> BTreeMap<String, u32> {
    pairs.iter().map(|(s, c)| (s.to_string(), *c)).collect()
}

fn request(target: &[(&str, u32)]) -> StartMigrationPlan {
    StartMigrationPlan {
        bus_kind: "memory".to_string(),
        input_bus: BusConfig::named("migration"),
        output_bus: BusConfig::named("migration"),
        target_distribution: distribution(target),
        initiated_by: "tests".to_string(),
    }
}

fn touch(key: String) -> BusMessage {
    BusMessage::Event(EventMessage::new("touch").with_attribute("key", key))
}

/// One joined service: its bus consumer and its migration participant.
struct Member {
    bus: Arc<MemoryMessageBus>,
    parking: Arc<MemoryMessageBus>,
    worker: WorkerHandle,
    participant: ParticipantHandle,
}

struct Cluster {
    ctx: MigrationContext,
    directory: Arc<ServiceDirectory>,
    registry: Arc<BusRegistry>,
    stores: BTreeMap<String, Arc<dyn EntityStore>>,
    members: BTreeMap<String, Member>,
}

impl Cluster {
    async fn new(total_slots: u32, weights: &[(&str, u32)]) -> Self {
        let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
        let slots = Arc::new(SlotsManager::new(store.clone()));
        slots.alloc_slots(total_slots, &distribution(weights)).await.unwrap();
        let buses = Arc::new(BusFactory::with_memory(POLL));
        let directory = Arc::new(ServiceDirectory::from_services(weights.iter().map(|(s, _)| *s)));
        Self {
            ctx: MigrationContext::new(store, slots, buses, config()),
            directory,
            registry: Arc::new(BusRegistry::new()),
            stores: BTreeMap::new(),
            members: BTreeMap::new(),
        }
    }

    fn join(&mut self, service: &str) {
        self.join_with(service, Arc::new(MemoryEntityStore::new()), RestartPolicy::fast());
    }

    /// Start a gated worker and a participant for `service`.
    fn join_with(&mut self, service: &str, entities: Arc<dyn EntityStore>, policy: RestartPolicy) {
        let bus = Arc::new(MemoryMessageBus::new(service, POLL));
        let parking = Arc::new(MemoryMessageBus::new(format!("{service}.parked"), POLL));
        self.registry.register(bus.clone());
        self.directory.register(service, service);

        let gate = Arc::new(OwnershipGate::new(
            service,
            self.ctx.store.clone(),
            self.ctx.slots.clone(),
            self.directory.clone(),
            self.registry.clone(),
            parking.clone(),
        ));
        let worker = spawn_service_worker(ServiceWorker::new(
            route_config(),
            bus.clone(),
            gate,
            Arc::new(EntityRecorder::new(entities.clone())),
        ));
        let participant =
            MigrationParticipant::new(service, self.ctx.clone(), entities.clone()).with_restart_policy(policy);

        self.members.insert(
            service.to_string(),
            Member {
                bus,
                parking,
                worker,
                participant: spawn_migration_participant(participant),
            },
        );
        self.stores.insert(service.to_string(), entities);
    }

    fn coordinator(&self) -> CoordinatorHandle {
        spawn_migration_coordinator(MigrationCoordinator::new(self.ctx.clone()).with_directory(self.directory.clone()))
    }

    /// Router keyed by the `key` attribute, consuming a fresh route-in bus.
    fn route(&self) -> (Arc<MemoryMessageBus>, RouteHandle, JoinHandle<slotway_core::Result<()>>) {
        let input = Arc::new(MemoryMessageBus::new("route-in", POLL));
        let route = MessageRoute::new(
            route_config(),
            input.clone(),
            self.ctx.slots.clone(),
            self.directory.clone(),
            self.registry.clone(),
            vec![Arc::new(AttributeKeyStrategy::new("by-key", "key"))],
        );
        let (handle, task) = spawn_message_route(route);
        (input, handle, task)
    }

    /// No service or parking bus holds a message.
    fn idle(&self) -> bool {
        self.members
            .values()
            .all(|m| m.bus.is_empty() && m.parking.is_empty())
    }

    /// Store `count` entities on the services owning their keys.
    async fn seed(&self, count: usize) {
        self.ctx.slots.refresh_if_stale().await.unwrap();
        for i in 0..count {
            let key = format!("entity-{i}");
            let owner = self.ctx.slots.get_service_by_key(&key).unwrap();
            self.stores[&owner]
                .save(StatefulEntity::new(key, json!({ "n": i })))
                .await
                .unwrap();
        }
    }

    /// Every stored entity, with the service holding it.
    async fn placement(&self) -> BTreeMap<String, Vec<(String, u64)>> {
        let mut placement: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
        for (service, store) in &self.stores {
            for entity in store.scan(None, usize::MAX).await.unwrap() {
                placement
                    .entry(entity.key)
                    .or_default()
                    .push((service.clone(), entity.revision));
            }
        }
        placement
    }

    async fn assert_owned_once(&self, expected: usize) {
        self.ctx.slots.refresh_if_stale().await.unwrap();
        let placement = self.placement().await;
        assert_eq!(placement.len(), expected);
        for (key, holders) in placement {
            assert_eq!(holders.len(), 1, "{key} stored by {holders:?}");
            assert_eq!(Some(holders[0].0.clone()), self.ctx.slots.get_service_by_key(&key), "{key}");
        }
    }

    /// Every stored entity carries `revision`.
    async fn assert_revisions(&self, revision: u64) {
        for (key, holders) in self.placement().await {
            for (service, found) in holders {
                assert_eq!(found, revision, "{key} on {service}");
            }
        }
    }

    async fn shutdown(self) {
        for (_, member) in self.members {
            member.worker.shutdown().await.unwrap();
            member.participant.shutdown().await;
        }
    }
}

async fn wait_for_state(coordinator: &CoordinatorHandle, state: MigrationState) -> MigrationStatus {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let status = coordinator.get_current_status().await.unwrap();
            if status.state == state {
                return status;
            }
            assert!(
                !status.state.is_terminal(),
                "plan ended in {} while waiting for {state}: {:?}",
                status.state,
                status.failure
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("migration did not reach the expected state")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rebalance_to_new_service() {
    let mut cluster = Cluster::new(100, &[("a", 1), ("b", 1)]).await;
    for service in ["a", "b", "c"] {
        cluster.join(service);
    }
    cluster.seed(500).await;
    let coordinator = cluster.coordinator();

    let started = coordinator
        .start_migration_plan(request(&[("a", 30), ("b", 20), ("c", 50)]))
        .await
        .unwrap();
    assert_eq!(started.plan.slot_diff.len(), 50);
    assert!(started.plan.slot_diff.iter().all(|m| m.to == "c"));

    let done = wait_for_state(&coordinator, MigrationState::Done).await;
    assert!(done.outputs.iter().all(|o| o.cleaned));
    assert_eq!(done.progress.len(), 1);
    assert_eq!(done.progress[0].finished_slots.len(), 50);

    cluster.ctx.slots.refresh_if_stale().await.unwrap();
    assert_eq!(
        cluster.ctx.slots.get_slots_distribution().distribution,
        distribution(&[("a", 30), ("b", 20), ("c", 50)])
    );
    assert_eq!(cluster.ctx.slots.version(), 2);
    cluster.assert_owned_once(500).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_plan_without_moves_is_done() {
    let cluster = Cluster::new(10, &[("a", 1), ("b", 1)]).await;
    let coordinator = cluster.coordinator();

    let status = coordinator
        .start_migration_plan(request(&[("a", 5), ("b", 5)]))
        .await
        .unwrap();
    assert_eq!(status.state, MigrationState::Done);
    assert!(status.plan.slot_diff.is_empty());

    // A finished plan does not block the next one.
    let again = coordinator
        .start_migration_plan(request(&[("a", 5), ("b", 5)]))
        .await
        .unwrap();
    assert_eq!(again.state, MigrationState::Done);
    assert_ne!(again.plan.id, status.plan.id);
    assert_eq!(cluster.ctx.slots.version(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_plan_rejected_while_active() {
    let mut cluster = Cluster::new(20, &[("a", 1), ("b", 1)]).await;
    cluster.join("a");
    cluster.join("b");
    let coordinator = cluster.coordinator();

    coordinator
        .start_migration_plan(request(&[("a", 15), ("b", 5)]))
        .await
        .unwrap();
    assert_eq!(
        coordinator
            .start_migration_plan(request(&[("a", 10), ("b", 10)]))
            .await,
        Err(RouteError::AlreadyExist)
    );
    assert_eq!(coordinator.clean_all().await, Err(RouteError::AlreadyExist));

    wait_for_state(&coordinator, MigrationState::Done).await;
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_invalid_requests() {
    let cluster = Cluster::new(10, &[("a", 1), ("b", 1)]).await;
    let coordinator = cluster.coordinator();

    assert_eq!(coordinator.get_current_status().await, Err(RouteError::NotFound));
    assert_eq!(coordinator.continue_migration_plan().await, Err(RouteError::NotFound));
    assert_eq!(coordinator.clean_all().await, Err(RouteError::NotFound));

    let short = coordinator.start_migration_plan(request(&[("a", 5), ("b", 4)])).await;
    assert!(matches!(short, Err(RouteError::InvalidSlots(_))));

    let mut unknown_kind = request(&[("a", 4), ("b", 6)]);
    unknown_kind.bus_kind = "carrier-pigeon".to_string();
    assert!(matches!(
        coordinator.start_migration_plan(unknown_kind).await,
        Err(RouteError::InitInputBus(_))
    ));
    assert_eq!(coordinator.get_current_status().await, Err(RouteError::NotFound));
}

#[tokio::test]
async fn test_unknown_target_service_rejected() {
    let cluster = Cluster::new(10, &[("a", 1), ("b", 1)]).await;
    let coordinator = cluster.coordinator();

    assert_eq!(
        coordinator
            .start_migration_plan(request(&[("a", 4), ("b", 3), ("c", 3)]))
            .await,
        Err(RouteError::UnknownService("c".to_string()))
    );
}

/// Meta store that refuses to record new plans.
struct RefusingMetaStore(MemoryMetaStore);

#[async_trait]
impl MetaStore for RefusingMetaStore {
    async fn load_slot_table(&self) -> slotway_core::Result<Option<SlotTable>> {
        self.0.load_slot_table().await
    }

    async fn slot_table_version(&self) -> slotway_core::Result<u64> {
        self.0.slot_table_version().await
    }

    async fn insert_slot_table(&self, table: &SlotTable) -> slotway_core::Result<()> {
        self.0.insert_slot_table(table).await
    }

    async fn replace_slot_table(&self, expected_version: u64, table: &SlotTable) -> slotway_core::Result<()> {
        self.0.replace_slot_table(expected_version, table).await
    }

    async fn load_migration(&self) -> slotway_core::Result<Option<MigrationRecord>> {
        self.0.load_migration().await
    }

    async fn migration_revision(&self) -> slotway_core::Result<u64> {
        self.0.migration_revision().await
    }

    async fn create_migration(&self, _record: &MigrationRecord) -> slotway_core::Result<MigrationRecord> {
        Err(RouteError::Store("write refused".to_string()))
    }

    async fn save_migration(&self, record: &MigrationRecord) -> slotway_core::Result<MigrationRecord> {
        self.0.save_migration(record).await
    }

    async fn delete_migration(&self) -> slotway_core::Result<()> {
        self.0.delete_migration().await
    }
}

#[tokio::test]
async fn test_channels_released_when_plan_not_stored() {
    let store: Arc<dyn MetaStore> = Arc::new(RefusingMetaStore(MemoryMetaStore::new()));
    let slots = Arc::new(SlotsManager::new(store.clone()));
    slots.alloc_slots(10, &distribution(&[("a", 1), ("b", 1)])).await.unwrap();
    let provider = Arc::new(MemoryBusProvider::new(POLL));
    let buses = Arc::new(BusFactory::new());
    buses.register(provider.clone());
    let coordinator = spawn_migration_coordinator(MigrationCoordinator::new(MigrationContext::new(
        store,
        slots,
        buses,
        config(),
    )));

    assert_eq!(
        coordinator
            .start_migration_plan(request(&[("a", 3), ("b", 3), ("c", 4)]))
            .await,
        Err(RouteError::Store("write refused".to_string()))
    );
    assert!(!provider.contains("migration.c"));
    assert_eq!(coordinator.get_current_status().await, Err(RouteError::NotFound));
}

#[tokio::test]
async fn test_plan_requires_allocation() {
    let store: Arc<dyn MetaStore> = Arc::new(MemoryMetaStore::new());
    let slots = Arc::new(SlotsManager::new(store.clone()));
    let ctx = MigrationContext::new(store, slots, Arc::new(BusFactory::with_memory(POLL)), config());
    let coordinator = spawn_migration_coordinator(MigrationCoordinator::new(ctx));

    assert_eq!(
        coordinator.start_migration_plan(request(&[("a", 1)])).await,
        Err(RouteError::NotAllocated)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drain_service() {
    let mut cluster = Cluster::new(16, &[("a", 1), ("b", 1)]).await;
    cluster.join("a");
    cluster.join("b");
    cluster.seed(200).await;
    let coordinator = cluster.coordinator();

    coordinator
        .start_migration_plan(request(&[("a", 16), ("b", 0)]))
        .await
        .unwrap();
    wait_for_state(&coordinator, MigrationState::Done).await;

    cluster.ctx.slots.refresh_if_stale().await.unwrap();
    assert_eq!(
        cluster.ctx.slots.get_all_services(),
        BTreeSet::from(["a".to_string()])
    );
    assert_eq!(cluster.stores["b"].count().await.unwrap(), 0);
    cluster.assert_owned_once(200).await;

    let removed = coordinator.clean_all().await.unwrap();
    assert_eq!(removed.state, MigrationState::Done);
    assert_eq!(coordinator.get_current_status().await, Err(RouteError::NotFound));
    cluster.shutdown().await;
}

/// Entity store whose writes always fail.
struct BrokenEntityStore;

#[async_trait]
impl EntityStore for BrokenEntityStore {
    async fn scan(&self, _after: Option<&str>, _limit: usize) -> slotway_core::Result<Vec<StatefulEntity>> {
        Ok(Vec::new())
    }

    async fn get(&self, _key: &str) -> slotway_core::Result<Option<StatefulEntity>> {
        Ok(None)
    }

    async fn save(&self, _entity: StatefulEntity) -> slotway_core::Result<()> {
        Err(RouteError::EntityStore("disk full".to_string()))
    }

    async fn batch_save(&self, _entities: Vec<StatefulEntity>) -> slotway_core::Result<usize> {
        Err(RouteError::EntityStore("disk full".to_string()))
    }

    async fn remove(&self, _keys: &[String]) -> slotway_core::Result<usize> {
        Ok(0)
    }

    async fn count(&self) -> slotway_core::Result<usize> {
        Ok(0)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exhausted_restarts_fail_plan() {
    let mut cluster = Cluster::new(20, &[("a", 1)]).await;
    cluster.join("a");
    let tight = RestartPolicy {
        max_restarts: 1,
        window: Duration::from_secs(30),
        backoff: POLL,
        max_backoff: POLL,
    };
    cluster.join_with("b", Arc::new(BrokenEntityStore), tight);
    cluster.seed(100).await;
    let coordinator = cluster.coordinator();

    coordinator
        .start_migration_plan(request(&[("a", 10), ("b", 10)]))
        .await
        .unwrap();
    let failed = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let status = coordinator.get_current_status().await.unwrap();
            if status.state.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(failed.state, MigrationState::Failed);
    assert!(failed.failure.unwrap().contains("input task of b"));
    // Ownership is untouched and the source keeps its entities.
    cluster.ctx.slots.refresh_if_stale().await.unwrap();
    assert_eq!(cluster.ctx.slots.version(), 1);
    assert_eq!(cluster.stores["a"].count().await.unwrap(), 100);

    coordinator.clean_all().await.unwrap();
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_continue_after_stop() {
    let mut cluster = Cluster::new(20, &[("a", 1), ("b", 1)]).await;
    cluster.join("a");
    cluster.join("b");
    cluster.seed(100).await;
    let coordinator = cluster.coordinator();

    coordinator
        .start_migration_plan(request(&[("a", 5), ("b", 15)]))
        .await
        .unwrap();
    assert!(coordinator.stop().await.unwrap().was_running);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !coordinator.is_stopped().await.unwrap() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // A fresh coordinator picks the persisted plan up.
    let restarted = cluster.coordinator();
    restarted.continue_migration_plan().await.unwrap();
    wait_for_state(&restarted, MigrationState::Done).await;
    cluster.assert_owned_once(100).await;
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_live_traffic_during_migration() {
    let mut cluster = Cluster::new(64, &[("a", 1), ("b", 1)]).await;
    for service in ["a", "b", "c"] {
        cluster.join(service);
    }
    let (input, route_handle, route_task) = cluster.route();

    let events = |range: std::ops::Range<usize>| -> Vec<BusMessage> { range.map(|i| touch(format!("k-{i}"))).collect() };
    input.write_batch(events(0..5_000)).await.unwrap();

    let coordinator = cluster.coordinator();
    coordinator
        .start_migration_plan(request(&[("a", 20), ("b", 20), ("c", 24)]))
        .await
        .unwrap();
    for chunk in (5_000..10_000).step_by(500) {
        input.write_batch(events(chunk..chunk + 500)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    wait_for_state(&coordinator, MigrationState::Done).await;

    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let mut stored = 0;
            for store in cluster.stores.values() {
                stored += store.count().await.unwrap();
            }
            if input.is_empty() && cluster.idle() && stored >= 10_000 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("events not fully processed");

    route_handle.stop();
    route_task.await.unwrap().unwrap();

    // Each key saw one event: it was applied once, by exactly one service.
    cluster.assert_owned_once(10_000).await;
    cluster.assert_revisions(1).await;
    assert!(cluster.stores["c"].count().await.unwrap() > 0);
    cluster.shutdown().await;
}

/// Entity store whose `batch_save` blocks until released, then fails.
struct HeldEntityStore {
    release: watch::Receiver<bool>,
}

#[async_trait]
impl EntityStore for HeldEntityStore {
    async fn scan(&self, _after: Option<&str>, _limit: usize) -> slotway_core::Result<Vec<StatefulEntity>> {
        Ok(Vec::new())
    }

    async fn get(&self, _key: &str) -> slotway_core::Result<Option<StatefulEntity>> {
        Ok(None)
    }

    async fn save(&self, _entity: StatefulEntity) -> slotway_core::Result<()> {
        Err(RouteError::EntityStore("disk full".to_string()))
    }

    async fn batch_save(&self, _entities: Vec<StatefulEntity>) -> slotway_core::Result<usize> {
        let mut release = self.release.clone();
        let _ = release.wait_for(|open| *open).await;
        Err(RouteError::EntityStore("disk full".to_string()))
    }

    async fn remove(&self, _keys: &[String]) -> slotway_core::Result<usize> {
        Ok(0)
    }

    async fn count(&self) -> slotway_core::Result<usize> {
        Ok(0)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_plan_keeps_updates_to_landed_slots() {
    let mut cluster = Cluster::new(20, &[("a", 1), ("b", 1)]).await;
    cluster.join("a");
    cluster.join("b");
    let (release, held) = watch::channel(false);
    let tight = RestartPolicy {
        max_restarts: 1,
        window: Duration::from_secs(30),
        backoff: POLL,
        max_backoff: POLL,
    };
    cluster.join_with("c", Arc::new(HeldEntityStore { release: held }), tight);
    cluster.seed(200).await;
    let (input, route_handle, route_task) = cluster.route();
    let coordinator = cluster.coordinator();

    // `a` hands slots to both `b` and `c`; `c` cannot store what it receives.
    let started = coordinator
        .start_migration_plan(request(&[("a", 2), ("b", 12), ("c", 6)]))
        .await
        .unwrap();
    assert!(started.plan.slot_diff.iter().any(|m| m.to == "b"));

    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let record = cluster.ctx.store.load_migration().await.unwrap().unwrap();
            if record.progress["b"].status == ProgressStatus::Finished {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("b never landed its slots");

    // Live updates for every key while b's slots have landed but the plan is open.
    input.write_batch((0..200).map(|i| touch(format!("entity-{i}"))).collect()).await.unwrap();
    tokio::time::timeout(Duration::from_secs(20), async {
        while cluster.members["b"].parking.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("b never parked an update");

    release.send_replace(true);
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let status = coordinator.get_current_status().await.unwrap();
            assert_ne!(status.state, MigrationState::Done);
            if status.state == MigrationState::Failed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("plan did not fail");

    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let record = cluster.ctx.store.load_migration().await.unwrap().unwrap();
            let a_count = cluster.stores["a"].count().await.unwrap();
            let b_count = cluster.stores["b"].count().await.unwrap();
            if input.is_empty() && cluster.idle() && record.progress["b"].discarded && a_count + b_count == 200 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("parked updates were not returned to the source");

    route_handle.stop();
    route_task.await.unwrap().unwrap();

    // Ownership never moved, and no update was lost with b's discarded copies.
    cluster.ctx.slots.refresh_if_stale().await.unwrap();
    assert_eq!(cluster.ctx.slots.version(), 1);
    cluster.assert_owned_once(200).await;
    cluster.assert_revisions(2).await;
    cluster.shutdown().await;
}
