//! Observability Module
//!
//! - `tracing`: subscriber setup with optional OTLP export
//! - `events`: structured domain events with consistent field names
//! - `metrics`: counters and gauges for routing and migration
//! - `limiter`: rate limiting for repeated dispatch loop errors
//! - `supervision`: restart policies for migration tasks

pub mod events;
pub mod limiter;
pub mod metrics;
pub mod supervision;
pub mod tracing;

pub use limiter::ErrorLogLimiter;
pub use metrics::register_metric_descriptions;
pub use supervision::{RestartPolicy, RestartTracker};
pub use tracing::{init_tracing, shutdown_tracing, TracingConfig};
