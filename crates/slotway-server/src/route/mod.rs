//! Message Routing
//!
//! The router consumes the route-in bus, binds every message to a routing key
//! and forwards it to the bus of the service owning the key's slot.
//!
//! ```text
//!  route-in ──read──▶ KeyingStrategy ──key──▶ SlotsManager ──service──▶ ServiceDirectory
//!     ▲                                                                     │ bus name
//!     └──────────────── ack (all forwards ok) ◀── write_batch ◀── BusRegistry
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let route = MessageRoute::new(config, input, slots, directory, buses, strategies);
//! let (handle, task) = spawn_message_route(route);
//! handle.pause();
//! handle.rerun();
//! handle.stop();
//! ```

mod directory;
mod dispatcher;
mod strategy;

pub use directory::ServiceDirectory;
pub use dispatcher::{spawn_message_route, MessageRoute, RouteHandle, RouteStatus};
pub use strategy::{resolve_key, AttributeKeyStrategy, KeyingStrategy};
