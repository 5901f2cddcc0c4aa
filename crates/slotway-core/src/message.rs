//! Bus Messages
//!
//! Every message carried by a slotway bus is one variant of [`BusMessage`].
//! Application events that the router does not interpret travel as
//! [`BusMessage::Event`]; the remaining variants are the control and entity
//! transfer messages the router and the migration tasks understand.

use crate::slots::Slot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Application event as received on the route-in bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: Uuid,
    /// Application level event type, e.g. `order_created`
    pub kind: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub receiver: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl EventMessage {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            sender: String::new(),
            receiver: String::new(),
            attributes: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }
}

/// Thread level operations forwarded to the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Pause,
    Continue,
    Kill,
    Repair,
}

/// Durable per-key state owned by the service that owns the key's slot.
///
/// `revision` increases with every change the execution engine persists; stores
/// keep the highest revision they have seen for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatefulEntity {
    pub key: String,
    pub revision: u64,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl StatefulEntity {
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            revision: 1,
            payload,
            updated_at: Utc::now(),
        }
    }

    /// Next revision of this entity carrying `payload`.
    pub fn updated(&self, payload: Value) -> Self {
        Self {
            key: self.key.clone(),
            revision: self.revision + 1,
            payload,
            updated_at: Utc::now(),
        }
    }

    pub fn slot(&self, total_slots: u32) -> Slot {
        crate::slots::slot_for_key(&self.key, total_slots)
    }
}

/// Closed set of messages carried over slotway buses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// Unrouted application event; keyed by the keying strategies.
    Event(EventMessage),
    /// Event forwarded by the router together with the key it resolved.
    Routed {
        strategy: String,
        key: String,
        event: EventMessage,
    },
    /// Full entity state streamed from a slot's source to its destination.
    MigrateEntity {
        source: String,
        target: String,
        slot: Slot,
        entity: StatefulEntity,
    },
    /// Completion marker: every entity of `slot` has been written before it.
    SlotFinished {
        source: String,
        target: String,
        slot: Slot,
        sent: u64,
    },
    /// Drop the entity for `key`.
    RemoveEntity { key: String },
    /// Thread level control command for the entity of `key`.
    ThreadControl { key: String, command: ControlCommand },
}

impl BusMessage {
    /// Key the message is bound to, if it already carries one.
    pub fn routing_key(&self) -> Option<&str> {
        match self {
            BusMessage::Event(_) | BusMessage::SlotFinished { .. } => None,
            BusMessage::Routed { key, .. } => Some(key),
            BusMessage::MigrateEntity { entity, .. } => Some(&entity.key),
            BusMessage::RemoveEntity { key } => Some(key),
            BusMessage::ThreadControl { key, .. } => Some(key),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BusMessage::Event(_) => "event",
            BusMessage::Routed { .. } => "routed",
            BusMessage::MigrateEntity { .. } => "migrate_entity",
            BusMessage::SlotFinished { .. } => "slot_finished",
            BusMessage::RemoveEntity { .. } => "remove_entity",
            BusMessage::ThreadControl { .. } => "thread_control",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key_by_variant() {
        let event = EventMessage::new("order_created").with_attribute("user", "u1");
        assert_eq!(BusMessage::Event(event.clone()).routing_key(), None);

        let routed = BusMessage::Routed {
            strategy: "user".into(),
            key: "u1".into(),
            event,
        };
        assert_eq!(routed.routing_key(), Some("u1"));

        let control = BusMessage::ThreadControl {
            key: "u2".into(),
            command: ControlCommand::Kill,
        };
        assert_eq!(control.routing_key(), Some("u2"));
        assert_eq!(control.kind(), "thread_control");
    }

    #[test]
    fn test_wire_tag_is_snake_case() {
        let msg = BusMessage::SlotFinished {
            source: "a".into(),
            target: "c".into(),
            slot: 7,
            sent: 3,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "slot_finished");
        assert_eq!(json["slot"], 7);
    }

    #[test]
    fn test_entity_revision_increases() {
        let entity = StatefulEntity::new("k", serde_json::json!({"step": 1}));
        let next = entity.updated(serde_json::json!({"step": 2}));
        assert_eq!(next.revision, entity.revision + 1);
        assert_eq!(next.key, "k");
        assert!(entity.slot(16) < 16);
    }
}
