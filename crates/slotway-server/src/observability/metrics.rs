//! Metrics
//!
//! Counters and gauges emitted through the `metrics` facade. The embedding
//! process decides which recorder (if any) is installed.
//!
//! Metrics tracked:
//! - `slotway_routed_messages_total` - messages forwarded, by service
//! - `slotway_dropped_messages_total` - unroutable messages, by reason
//! - `slotway_route_ack_failures_total` - batches left unacknowledged
//! - `slotway_migration_entities_sent_total` - entities streamed by output tasks
//! - `slotway_migration_entities_received_total` - entities saved by input tasks
//! - `slotway_slot_table_version` - table version seen by this process
//! - `slotway_migration_state` - coordinator state as an ordinal

use metrics::{counter, describe_counter, describe_gauge, gauge};
use slotway_core::MigrationState;

pub fn register_metric_descriptions() {
    describe_counter!(
        "slotway_routed_messages_total",
        "Messages forwarded to their owning service"
    );
    describe_counter!(
        "slotway_dropped_messages_total",
        "Messages discarded because no owner could be resolved"
    );
    describe_counter!(
        "slotway_route_ack_failures_total",
        "Inbound batches left unacknowledged after a forward failure"
    );
    describe_counter!(
        "slotway_migration_entities_sent_total",
        "Entities streamed to a migration channel"
    );
    describe_counter!(
        "slotway_migration_entities_received_total",
        "Entities persisted from a migration channel"
    );
    describe_gauge!(
        "slotway_slot_table_version",
        "Slot table version currently cached"
    );
    describe_gauge!(
        "slotway_migration_state",
        "Migration coordinator state (0=IDLE .. 6=FAILED)"
    );
}

pub fn record_routed(service: &str, count: usize) {
    counter!("slotway_routed_messages_total", "service" => service.to_string()).increment(count as u64);
}

pub fn record_dropped(reason: &'static str) {
    counter!("slotway_dropped_messages_total", "reason" => reason).increment(1);
}

pub fn record_ack_failure() {
    counter!("slotway_route_ack_failures_total").increment(1);
}

pub fn record_entities_sent(source: &str, count: usize) {
    counter!("slotway_migration_entities_sent_total", "source" => source.to_string())
        .increment(count as u64);
}

pub fn record_entities_received(target: &str, count: usize) {
    counter!("slotway_migration_entities_received_total", "target" => target.to_string())
        .increment(count as u64);
}

pub fn set_slot_table_version(version: u64) {
    gauge!("slotway_slot_table_version").set(version as f64);
}

pub fn set_migration_state(state: MigrationState) {
    let ordinal = match state {
        MigrationState::Idle => 0.0,
        MigrationState::Planning => 1.0,
        MigrationState::Transferring => 2.0,
        MigrationState::Verifying => 3.0,
        MigrationState::Cutover => 4.0,
        MigrationState::Done => 5.0,
        MigrationState::Failed => 6.0,
    };
    gauge!("slotway_migration_state").set(ordinal);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_without_recorder() {
        register_metric_descriptions();
        record_routed("a", 3);
        record_dropped("unroutable");
        record_ack_failure();
        record_entities_sent("a", 10);
        record_entities_received("c", 10);
        set_slot_table_version(2);
        set_migration_state(MigrationState::Verifying);
    }
}
