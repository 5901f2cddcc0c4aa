//! Ownership Gate
//!
//! Sits in front of a service's own bus consumer and decides, per message,
//! whether the service may process it now.
//!
//! While a plan moves slots:
//! - the destination parks messages for its incoming slots on a dedicated
//!   parking bus until the plan reaches CUTOVER, so nothing is applied to a
//!   copy whose ownership could still fall back to the source
//! - the source keeps processing a released slot until the slot's
//!   destination parks, then forwards its messages there
//!
//! Each gate writes its role into the migration record as it takes it up
//! (`gate_ready`). A source's scan waits for its own gate, so no local write
//! to a released slot can slip past the scan.
//!
//! Parked messages leave the parking bus in the order they were parked and
//! before anything newer is read from the service bus: after CUTOVER they are
//! processed locally, after a failure they go back to the slot owner.
//!
//! Outside a transfer, messages for slots the service does not own are
//! forwarded to the owner.

use super::refresh_record;
use crate::bus::{BusRegistry, MessageBus};
use crate::cache::VersionedCache;
use crate::observability::events;
use crate::route::ServiceDirectory;
use crate::slots::SlotsManager;
use crate::store::{update_migration, MetaStore};
use slotway_core::{BusMessage, MigrationRecord, MigrationState, Result, RouteError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Process locally
    Local,
    /// Forward to the named service
    Redirect(String),
    /// Hold on the parking bus until the slot's owner is final
    Park,
}

pub struct OwnershipGate {
    service: String,
    store: Arc<dyn MetaStore>,
    slots: Arc<SlotsManager>,
    directory: Arc<ServiceDirectory>,
    buses: Arc<BusRegistry>,
    parking: Arc<dyn MessageBus>,
    /// The parking bus may hold messages. Starts set so leftovers of an
    /// earlier run are released before new traffic.
    parked: AtomicBool,
    record: VersionedCache<MigrationRecord>,
}

impl OwnershipGate {
    pub fn new(
        service: impl Into<String>,
        store: Arc<dyn MetaStore>,
        slots: Arc<SlotsManager>,
        directory: Arc<ServiceDirectory>,
        buses: Arc<BusRegistry>,
        parking: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            service: service.into(),
            store,
            slots,
            directory,
            buses,
            parking,
            parked: AtomicBool::new(true),
            record: VersionedCache::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Refresh the migration record, then the slot table, then acknowledge
    /// any role this service took up in a transferring plan.
    ///
    /// The table is read second: a cutover is written before the record
    /// leaves CUTOVER, so a finished record always comes with the new table.
    pub async fn refresh(&self) -> Result<()> {
        let record = refresh_record(self.store.as_ref(), &self.record).await?;
        self.slots.refresh_if_stale().await?;
        if let Some(record) = record {
            self.acknowledge(&record).await?;
        }
        Ok(())
    }

    async fn acknowledge(&self, record: &MigrationRecord) -> Result<()> {
        let mut preview = record.clone();
        if take_up_role(&mut preview, &self.service) == (false, false) {
            return Ok(());
        }

        let (plan_id, service) = (record.plan.id, self.service.clone());
        let mut taken = (false, false);
        let updated = update_migration(self.store.as_ref(), |r| {
            if r.plan.id != plan_id {
                return false;
            }
            taken = take_up_role(r, &service);
            taken != (false, false)
        })
        .await?;
        self.record.store(Some(updated));

        let (parking, redirecting) = taken;
        if parking || redirecting {
            events::ownership_gate_ready(&self.service, &plan_id.to_string(), parking, redirecting);
        }
        Ok(())
    }

    pub fn disposition(&self, key: &str) -> Disposition {
        let Some(table) = self.slots.table() else {
            return Disposition::Local;
        };
        let slot = table.slot_for_key(key);

        if let Some(record) = self.record.get() {
            if let Some(slot_move) = record.in_flight_move(slot) {
                if slot_move.to == self.service {
                    return if record.state == MigrationState::Cutover {
                        Disposition::Local
                    } else {
                        Disposition::Park
                    };
                }
                if slot_move.from == self.service && record.parking_ready(&slot_move.to) {
                    return Disposition::Redirect(slot_move.to.clone());
                }
            }
        }

        match table.owner(slot) {
            Some(owner) if owner != self.service => Disposition::Redirect(owner.to_string()),
            _ => Disposition::Local,
        }
    }

    /// Incoming slots of an in-flight plan are still held back.
    pub fn is_holding(&self) -> bool {
        self.record.get().is_some_and(|r| {
            matches!(r.state, MigrationState::Transferring | MigrationState::Verifying)
                && r.progress.contains_key(&self.service)
        })
    }

    /// Split a batch read from the service bus: redirected messages are
    /// written to their destination, parked ones to the parking bus, and the
    /// rest is returned for local processing. The caller acknowledges the
    /// batch only after this succeeds.
    pub async fn admit(&self, batch: Vec<BusMessage>) -> Result<Vec<BusMessage>> {
        let (local, _) = self.split(batch).await?;
        Ok(local)
    }

    /// Next batch of parked messages, once nothing is held back any more.
    ///
    /// Returns `None` when there is nothing to release. Otherwise the caller
    /// processes the returned messages, then calls [`Self::ack_parked`], and
    /// keeps releasing before it reads the service bus again.
    pub async fn release_parked(&self, max: usize) -> Result<Option<Vec<BusMessage>>> {
        if !self.parked.load(Ordering::SeqCst) || self.is_holding() {
            return Ok(None);
        }
        let batch = self.parking.read(max).await?;
        if batch.is_empty() {
            self.parked.store(false, Ordering::SeqCst);
            return Ok(None);
        }
        let (local, redirected) = self.split(batch).await?;
        events::parked_messages_released(&self.service, local.len(), redirected);
        Ok(Some(local))
    }

    pub async fn ack_parked(&self) -> Result<()> {
        self.parking.ack().await?;
        Ok(())
    }

    /// Returns the local share and the number of redirected messages.
    async fn split(&self, batch: Vec<BusMessage>) -> Result<(Vec<BusMessage>, usize)> {
        let mut local = Vec::with_capacity(batch.len());
        let mut redirects: BTreeMap<String, Vec<BusMessage>> = BTreeMap::new();
        let mut parked = Vec::new();

        for message in batch {
            let Some(key) = message.routing_key().map(str::to_string) else {
                local.push(message);
                continue;
            };
            match self.disposition(&key) {
                Disposition::Local => local.push(message),
                Disposition::Redirect(service) => redirects.entry(service).or_default().push(message),
                Disposition::Park => parked.push(message),
            }
        }

        let mut redirected = 0;
        for (service, messages) in redirects {
            let bus_name = self
                .directory
                .bus_of(&service)
                .ok_or_else(|| RouteError::UnknownService(service.clone()))?;
            let bus = self.buses.require(&bus_name)?;
            debug!(
                service = %self.service,
                destination = %service,
                count = messages.len(),
                "Redirecting messages to slot owner"
            );
            redirected += messages.len();
            bus.write_batch(messages).await?;
        }
        if !parked.is_empty() {
            trace!(service = %self.service, count = parked.len(), "Parking messages for incoming slots");
            self.parked.store(true, Ordering::SeqCst);
            self.parking.write_batch(parked).await?;
        }
        Ok((local, redirected))
    }
}

/// Mark the roles `service` holds in a TRANSFERRING record: the destination
/// side at once, the source side once every destination it feeds parks.
/// Returns which of the two were newly set.
fn take_up_role(record: &mut MigrationRecord, service: &str) -> (bool, bool) {
    if record.state != MigrationState::Transferring {
        return (false, false);
    }
    let mut parking = false;
    if let Some(progress) = record.progress.get_mut(service) {
        if !progress.gate_ready {
            progress.gate_ready = true;
            parking = true;
        }
    }
    let mut redirecting = false;
    if record.outputs.get(service).is_some_and(|o| !o.gate_ready) && record.destinations_ready(service) {
        if let Some(output) = record.outputs.get_mut(service) {
            output.gate_ready = true;
            redirecting = true;
        }
    }
    (parking, redirecting)
}
