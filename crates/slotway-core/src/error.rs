//! Error Types
//!
//! Typed failures returned across the slot and migration APIs. Every variant
//! carries a stable snake_case code so administrative callers can branch on it
//! without parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Transport level failures raised by message bus implementations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("message bus {0} is closed")]
    Closed(String),
    #[error("message bus {bus} unavailable: {reason}")]
    Unavailable { bus: String, reason: String },
    #[error("unknown message bus implementation: {0}")]
    UnknownImplementation(String),
    #[error("invalid message bus config: {0}")]
    InvalidConfig(String),
    #[error("message bus not registered: {0}")]
    NotRegistered(String),
}

/// Failures of slot allocation, routing and migration operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("slots have already been allocated")]
    AlreadyAllocated,
    #[error("invalid slot weights: {0}")]
    InvalidWeights(String),
    #[error("slots have not been allocated")]
    NotAllocated,
    #[error("invalid slots distribution: {0}")]
    InvalidSlots(String),
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("a migration plan is already running")]
    AlreadyExist,
    #[error("no migration plan found")]
    NotFound,
    #[error("failed to open migration input bus: {0}")]
    InitInputBus(BusError),
    #[error("failed to open migration output bus: {0}")]
    InitOutputBus(BusError),
    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },
    #[error("meta store error: {0}")]
    Store(String),
    #[error("entity store error: {0}")]
    EntityStore(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error("migration coordinator unavailable: {0}")]
    Coordinator(String),
}

impl RouteError {
    /// Stable error code reported in administrative results.
    pub fn code(&self) -> &'static str {
        match self {
            RouteError::AlreadyAllocated => "already_allocated",
            RouteError::InvalidWeights(_) => "invalid_weights",
            RouteError::NotAllocated => "not_allocated",
            RouteError::InvalidSlots(_) => "invalid_slots",
            RouteError::UnknownService(_) => "unknown_service",
            RouteError::AlreadyExist => "already_exist",
            RouteError::NotFound => "not_found",
            RouteError::InitInputBus(_) => "init_input_message_bus_error",
            RouteError::InitOutputBus(_) => "init_output_message_bus_error",
            RouteError::VersionConflict { .. } => "version_conflict",
            RouteError::Store(_) => "store_error",
            RouteError::EntityStore(_) => "entity_store_error",
            RouteError::Bus(_) => "bus_error",
            RouteError::Coordinator(_) => "coordinator_error",
        }
    }

    /// Transport and storage failures may succeed when retried; validation
    /// failures never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            RouteError::Bus(e) => matches!(e, BusError::Closed(_) | BusError::Unavailable { .. }),
            RouteError::Store(_) | RouteError::EntityStore(_) | RouteError::VersionConflict { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T, E = RouteError> = std::result::Result<T, E>;

/// Structured result of an administrative call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl AdminResult {
    pub fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                ok: true,
                code: None,
                message: "ok".to_string(),
                data: Some(value),
            },
            Err(e) => Self {
                ok: false,
                code: Some("serialization_error".to_string()),
                message: e.to_string(),
                data: None,
            },
        }
    }

    pub fn fail(err: &RouteError) -> Self {
        Self {
            ok: false,
            code: Some(err.code().to_string()),
            message: err.to_string(),
            data: None,
        }
    }

    pub fn from_result<T: Serialize>(result: &Result<T>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(e) => Self::fail(e),
        }
    }
}
