//! Slotway - Slot Based Message Router
//!
//! Administrative CLI against the etcd-backed slot table and migration
//! record, plus `serve`, which hosts the router and every known service in
//! one process. Every command prints one JSON `AdminResult`.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use slotway_core::{AdminResult, BusConfig, BusMessage, MigrationState, MigrationStatus, RouteError};
use slotway_server::bus::{BusFactory, BusRegistry, MemoryMessageBus, MessageBus, MEMORY_BUS};
use slotway_server::config::SlotwayConfig;
use slotway_server::entity::MemoryEntityStore;
use slotway_server::migration::{
    spawn_migration_coordinator, spawn_migration_participant, CoordinatorHandle, MigrationContext,
    MigrationCoordinator, MigrationParticipant, OwnershipGate, StartMigrationPlan,
};
use slotway_server::observability::{self, TracingConfig};
use slotway_server::route::{spawn_message_route, AttributeKeyStrategy, KeyingStrategy, MessageRoute, ServiceDirectory};
use slotway_server::slots::SlotsManager;
use slotway_server::store::{EtcdMetaStore, MetaStore};
use slotway_server::version;
use slotway_server::worker::{spawn_service_worker, EntityRecorder, ServiceWorker};
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "slotway", version = version::VERSION, about = "Slot based message router administration")]
struct Cli {
    /// etcd endpoints, comma separated
    #[arg(long, env = "ETCD_ENDPOINTS", value_delimiter = ',', global = true)]
    etcd_endpoints: Option<Vec<String>>,

    /// Key prefix of all slotway records in etcd
    #[arg(long, env = "SLOTWAY_KEY_PREFIX", global = true)]
    key_prefix: Option<String>,

    /// Service known besides those in the slot table; repeatable
    #[arg(long = "service", global = true)]
    services: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Allocate the slot table, e.g. `alloc --total 1024 --weight a=1 --weight b=2`
    Alloc {
        #[arg(long)]
        total: u32,
        #[arg(long = "weight", value_parser = parse_share, required = true)]
        weights: Vec<(String, u32)>,
    },
    /// Current slot count per service
    Distribution,
    /// Slot and owning service of a routing key
    Lookup { key: String },
    /// Start a migration plan towards the given slot counts
    Migrate {
        #[arg(long = "target", value_parser = parse_share, required = true)]
        target: Vec<(String, u32)>,
        /// Bus implementation of the migration channels
        #[arg(long, default_value = MEMORY_BUS)]
        bus_kind: String,
        /// Base name of the per-destination migration channels
        #[arg(long, default_value = "migration")]
        channel: String,
        #[arg(long, env = "USER", default_value = "slotway-cli")]
        initiated_by: String,
        /// Keep driving the plan until it finishes; the transfer itself is
        /// carried out by the services hosted under `slotway serve`
        #[arg(long)]
        wait: bool,
    },
    /// State and progress of the current plan
    Status,
    /// Drive the persisted plan until it finishes, alongside `slotway serve`
    Coordinate,
    /// Remove a finished plan record
    Clean,
    /// Host the router and every known service: JSON bus messages read from
    /// stdin are routed, and persisted plans are driven, until Ctrl-C
    Serve {
        /// Event attribute holding the routing key; repeatable, tried in order
        #[arg(long = "key-attribute", default_value = "thread_id")]
        key_attributes: Vec<String>,
    },
    /// Build information
    Version,
}

/// Parse `service=count`.
fn parse_share(raw: &str) -> Result<(String, u32), String> {
    let (service, count) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected SERVICE=COUNT, got '{raw}'"))?;
    let count = count
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid count in '{raw}': {e}"))?;
    Ok((service.trim().to_string(), count))
}

fn print_result(result: &AdminResult) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(if result.ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    if let Command::Version = cli.command {
        println!("{}", version::build_info());
        return Ok(ExitCode::SUCCESS);
    }

    if let Err(e) = observability::init_tracing(&TracingConfig::from_env()) {
        eprintln!("failed to initialize tracing: {e}");
    }
    observability::register_metric_descriptions();

    let result = run(cli).await;
    observability::shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = SlotwayConfig::from_env();
    if let Some(endpoints) = cli.etcd_endpoints {
        config.store.etcd_endpoints = endpoints;
    }
    if let Some(prefix) = cli.key_prefix {
        config.store.key_prefix = prefix;
    }
    config.services.extend(cli.services);
    info!(version = %version::full_version(), endpoints = ?config.store.etcd_endpoints, "Starting slotway");

    let store: Arc<dyn MetaStore> = Arc::new(
        EtcdMetaStore::connect(&config.store)
            .await
            .context("connecting to etcd")?,
    );
    let slots = Arc::new(SlotsManager::init(store.clone()).await?);

    let result = match cli.command {
        Command::Alloc { total, weights } => {
            let weights: BTreeMap<String, u32> = weights.into_iter().collect();
            AdminResult::from_result(&slots.alloc_slots(total, &weights).await)
        }
        Command::Distribution => match slots.table() {
            Some(_) => AdminResult::ok(&slots.get_slots_distribution()),
            None => AdminResult::fail(&RouteError::NotAllocated),
        },
        Command::Lookup { key } => match (slots.get_slot_by_key(&key), slots.get_service_by_key(&key)) {
            (Some(slot), Some(service)) => AdminResult::ok(&serde_json::json!({
                "key": key,
                "slot": slot,
                "service": service,
                "version": slots.version(),
            })),
            _ => AdminResult::fail(&RouteError::NotAllocated),
        },
        Command::Migrate {
            target,
            bus_kind,
            channel,
            initiated_by,
            wait,
        } => {
            let coordinator = coordinator(store, slots, &config).await;
            let request = StartMigrationPlan {
                bus_kind,
                input_bus: BusConfig::named(channel.clone()),
                output_bus: BusConfig::named(channel),
                target_distribution: target.into_iter().collect(),
                initiated_by,
            };
            match coordinator.start_migration_plan(request).await {
                Ok(status) if wait && !status.state.is_terminal() => {
                    AdminResult::from_result(&drive(&coordinator, &config).await)
                }
                result => AdminResult::from_result(&result),
            }
        }
        Command::Status => {
            let coordinator = coordinator(store, slots, &config).await;
            AdminResult::from_result(&coordinator.get_current_status().await)
        }
        Command::Coordinate => {
            let coordinator = coordinator(store, slots, &config).await;
            match coordinator.continue_migration_plan().await {
                Ok(status) if !status.state.is_terminal() => {
                    AdminResult::from_result(&drive(&coordinator, &config).await)
                }
                result => AdminResult::from_result(&result),
            }
        }
        Command::Clean => {
            let coordinator = coordinator(store, slots, &config).await;
            AdminResult::from_result(&coordinator.clean_all().await)
        }
        Command::Serve { key_attributes } => AdminResult::from_result(&serve(store, slots, &config, key_attributes).await),
        Command::Version => AdminResult::ok(&version::full_version()),
    };
    print_result(&result)
}

/// Configured services plus every service owning slots.
fn directory(slots: &SlotsManager, config: &SlotwayConfig) -> Arc<ServiceDirectory> {
    let mut services = slots.get_all_services();
    services.extend(config.services.iter().cloned());
    Arc::new(ServiceDirectory::from_services(services))
}

async fn coordinator(store: Arc<dyn MetaStore>, slots: Arc<SlotsManager>, config: &SlotwayConfig) -> CoordinatorHandle {
    if let Err(e) = slots.refresh_if_stale().await {
        warn!(error = %e, "Slot table refresh failed, using the cached table");
    }
    let directory = directory(&slots, config);
    let buses = Arc::new(BusFactory::with_memory(config.route.poll_timeout));
    let ctx = MigrationContext::new(store, slots, buses, config.migration.clone());
    spawn_migration_coordinator(MigrationCoordinator::new(ctx).with_directory(directory))
}

/// Run the router, one gated worker and participant per known service, and a
/// coordinator that picks up persisted plans, until Ctrl-C.
async fn serve(
    store: Arc<dyn MetaStore>,
    slots: Arc<SlotsManager>,
    config: &SlotwayConfig,
    key_attributes: Vec<String>,
) -> Result<serde_json::Value, RouteError> {
    let directory = directory(&slots, config);
    let registry = Arc::new(BusRegistry::new());
    let buses = Arc::new(BusFactory::with_memory(config.route.poll_timeout));
    let ctx = MigrationContext::new(store.clone(), slots.clone(), buses, config.migration.clone());

    let mut workers = Vec::new();
    let mut participants = Vec::new();
    for service in directory.names() {
        let bus = Arc::new(MemoryMessageBus::new(service.clone(), config.route.poll_timeout));
        let parking = Arc::new(MemoryMessageBus::new(format!("{service}.parked"), config.route.poll_timeout));
        registry.register(bus.clone());

        let entities = Arc::new(MemoryEntityStore::new());
        let gate = Arc::new(OwnershipGate::new(
            service.clone(),
            store.clone(),
            slots.clone(),
            directory.clone(),
            registry.clone(),
            parking,
        ));
        workers.push(spawn_service_worker(ServiceWorker::new(
            config.route.clone(),
            bus,
            gate,
            Arc::new(EntityRecorder::new(entities.clone())),
        )));
        participants.push(spawn_migration_participant(MigrationParticipant::new(
            service,
            ctx.clone(),
            entities,
        )));
    }

    let input = Arc::new(MemoryMessageBus::new(config.route.input_bus.clone(), config.route.poll_timeout));
    let strategies: Vec<Arc<dyn KeyingStrategy>> = key_attributes
        .iter()
        .map(|attribute| Arc::new(AttributeKeyStrategy::new(attribute.clone(), attribute.clone())) as Arc<dyn KeyingStrategy>)
        .collect();
    let route = MessageRoute::new(
        config.route.clone(),
        input.clone(),
        slots,
        directory.clone(),
        registry,
        strategies,
    );
    let (route_handle, route_task) = spawn_message_route(route);
    let ingress = tokio::spawn(read_ingress(input));

    let coordinator = spawn_migration_coordinator(MigrationCoordinator::new(ctx).with_directory(directory.clone()));
    info!(services = ?directory.names(), "Serving");
    loop {
        match coordinator.continue_migration_plan().await {
            Ok(_) | Err(RouteError::NotFound) => {}
            Err(e) => warn!(error = %e, "Could not pick up the persisted plan"),
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(config.migration.poll_interval) => {}
        }
    }

    info!("Shutting down");
    ingress.abort();
    coordinator.stop().await?;
    route_handle.stop();
    match route_task.await {
        Ok(result) => result?,
        Err(e) => warn!(error = %e, "Route task ended abnormally"),
    }
    for worker in workers {
        worker.shutdown().await?;
    }
    for participant in participants {
        participant.shutdown().await;
    }
    Ok(serde_json::json!({ "services": directory.names() }))
}

/// Feed JSON bus messages, one per stdin line, into the route-in bus.
async fn read_ingress(input: Arc<MemoryMessageBus>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Reading stdin failed");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let message = match serde_json::from_str::<BusMessage>(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Skipping malformed message");
                continue;
            }
        };
        if let Err(e) = input.write(message).await {
            warn!(error = %e, "Route input rejected message");
        }
    }
}

/// Wait for the driver to finish the plan, or for Ctrl-C.
async fn drive(coordinator: &CoordinatorHandle, config: &SlotwayConfig) -> Result<MigrationStatus, RouteError> {
    let mut last_state = MigrationState::Idle;
    loop {
        let status = coordinator.get_current_status().await?;
        if status.state != last_state {
            info!(plan_id = %status.plan.id, state = %status.state, "Migration progress");
            last_state = status.state;
        }
        if status.state.is_terminal() {
            return Ok(status);
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; the plan stays persisted and can be resumed with `slotway coordinate`");
                coordinator.stop().await?;
                return coordinator.get_current_status().await;
            }
            _ = tokio::time::sleep(config.migration.poll_interval) => {}
        }
    }
}
