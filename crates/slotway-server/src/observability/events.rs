//! Structured Events
//!
//! One function per domain event so that every emitter uses the same field
//! names. Log pipelines key on `event_type`.
//!
//! Event types:
//! - `slots_allocated` - initial slot table written
//! - `slot_table_refreshed` - a component picked up a new table version
//! - `migration_plan_started` - plan accepted and persisted
//! - `migration_state_changed` - coordinator state transition
//! - `ownership_gate_ready` - a service's gate acknowledged an in-flight plan
//! - `slot_transfer_finished` - destination persisted a slot's completion marker
//! - `cutover_applied` - slot table replaced with the migrated owners
//! - `output_task_finished` / `input_task_finished` - migration task lifecycle
//! - `migration_task_failed` - task gave up after exhausting restarts
//! - `transfer_discarded` - destination removed the copies of a failed plan
//! - `parked_messages_released` - held live traffic handed back for processing
//! - `message_dropped` - unroutable message discarded
//! - `route_stopped` - dispatch loop exited

use tracing::{error, info, warn};

pub fn slots_allocated(total_slots: u32, services: usize, version: u64) {
    info!(
        event_type = "slots_allocated",
        total_slots = total_slots,
        services = services,
        version = version,
        "Slots allocated"
    );
}

pub fn slot_table_refreshed(previous_version: u64, new_version: u64) {
    info!(
        event_type = "slot_table_refreshed",
        previous_version = previous_version,
        new_version = new_version,
        "Slot table refreshed"
    );
}

pub fn migration_plan_started(plan_id: &str, moved_slots: usize, destinations: usize, initiated_by: &str) {
    info!(
        event_type = "migration_plan_started",
        plan_id = %plan_id,
        moved_slots = moved_slots,
        destinations = destinations,
        initiated_by = %initiated_by,
        "Migration plan started"
    );
}

pub fn migration_state_changed(plan_id: &str, previous_state: &str, new_state: &str) {
    info!(
        event_type = "migration_state_changed",
        plan_id = %plan_id,
        previous_state = %previous_state,
        new_state = %new_state,
        "Migration state changed"
    );
}

pub fn migration_failed(plan_id: &str, reason: &str) {
    error!(
        event_type = "migration_state_changed",
        plan_id = %plan_id,
        new_state = "FAILED",
        reason = %reason,
        "Migration failed"
    );
}

pub fn ownership_gate_ready(service: &str, plan_id: &str, parking: bool, redirecting: bool) {
    info!(
        event_type = "ownership_gate_ready",
        service = %service,
        plan_id = %plan_id,
        parking = parking,
        redirecting = redirecting,
        "Ownership gate acknowledged migration"
    );
}

pub fn slot_transfer_finished(target_service: &str, slot: u32, finished: usize, expected: u32) {
    info!(
        event_type = "slot_transfer_finished",
        target_service = %target_service,
        slot = slot,
        finished = finished,
        expected = expected,
        "Slot transfer finished"
    );
}

pub fn cutover_applied(plan_id: &str, moved_slots: usize, table_version: u64) {
    info!(
        event_type = "cutover_applied",
        plan_id = %plan_id,
        moved_slots = moved_slots,
        table_version = table_version,
        "Cutover applied"
    );
}

pub fn output_task_finished(source_service: &str, sent: u64, slots: usize) {
    info!(
        event_type = "output_task_finished",
        source_service = %source_service,
        sent = sent,
        slots = slots,
        "Migration output finished"
    );
}

pub fn input_task_finished(target_service: &str, received: u64, slots: usize) {
    info!(
        event_type = "input_task_finished",
        target_service = %target_service,
        received = received,
        slots = slots,
        "Migration input finished"
    );
}

pub fn migration_task_failed(service: &str, role: &str, error: &str, restarts: usize) {
    error!(
        event_type = "migration_task_failed",
        service = %service,
        role = %role,
        error = %error,
        restarts = restarts,
        "Migration task failed permanently"
    );
}

pub fn transfer_discarded(target_service: &str, plan_id: &str, removed: usize) {
    warn!(
        event_type = "transfer_discarded",
        target_service = %target_service,
        plan_id = %plan_id,
        removed = removed,
        "Copies of a failed transfer removed"
    );
}

pub fn parked_messages_released(service: &str, local: usize, redirected: usize) {
    info!(
        event_type = "parked_messages_released",
        service = %service,
        local = local,
        redirected = redirected,
        "Parked messages released"
    );
}

pub fn message_dropped(kind: &str, reason: &str) {
    warn!(
        event_type = "message_dropped",
        kind = %kind,
        reason = %reason,
        "Message dropped"
    );
}

pub fn route_stopped(input_bus: &str, routed: u64) {
    info!(
        event_type = "route_stopped",
        input_bus = %input_bus,
        routed = routed,
        "Message route stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_do_not_panic() {
        slots_allocated(100, 3, 1);
        slot_table_refreshed(1, 2);
        migration_plan_started("plan", 50, 1, "ops");
        migration_state_changed("plan", "PLANNING", "TRANSFERRING");
        migration_failed("plan", "received count regressed");
        slot_transfer_finished("c", 7, 1, 50);
        cutover_applied("plan", 50, 2);
        output_task_finished("a", 10, 20);
        input_task_finished("c", 10, 50);
        migration_task_failed("c", "input", "store down", 5);
        ownership_gate_ready("c", "plan", true, false);
        transfer_discarded("c", "plan", 12);
        parked_messages_released("c", 3, 1);
        message_dropped("event", "no keying strategy matched");
        route_stopped("route-in", 42);
    }
}
