//! Keying strategies.
//!
//! A strategy decides whether it applies to an event and, if so, which
//! routing key the event belongs to. The router tries strategies in order and
//! uses the first match.

use serde_json::Value;
use slotway_core::EventMessage;
use std::collections::BTreeSet;
use std::sync::Arc;

pub trait KeyingStrategy: Send + Sync {
    /// Name recorded on routed messages
    fn name(&self) -> &str;

    /// Routing key of `event`, or `None` when the strategy does not apply.
    fn routing_key(&self, event: &EventMessage) -> Option<String>;
}

/// Keys events by the value of one attribute, optionally limited to a set of
/// event kinds.
#[derive(Debug, Clone)]
pub struct AttributeKeyStrategy {
    name: String,
    attribute: String,
    kinds: BTreeSet<String>,
}

impl AttributeKeyStrategy {
    pub fn new(name: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attribute: attribute.into(),
            kinds: BTreeSet::new(),
        }
    }

    /// Restrict the strategy to events of the given kinds.
    pub fn for_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kinds = kinds.into_iter().map(Into::into).collect();
        self
    }
}

impl KeyingStrategy for AttributeKeyStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn routing_key(&self, event: &EventMessage) -> Option<String> {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return None;
        }
        match event.attribute(&self.attribute)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// First matching strategy name and key for `event`.
pub fn resolve_key(strategies: &[Arc<dyn KeyingStrategy>], event: &EventMessage) -> Option<(String, String)> {
    strategies.iter().find_map(|strategy| {
        strategy
            .routing_key(event)
            .map(|key| (strategy.name().to_string(), key))
    })
}
