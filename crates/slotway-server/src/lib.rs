//! Slotway Server Library
//!
//! Slot based message routing with live slot migration between services.

pub mod bus;
pub mod cache;
pub mod config;
pub mod entity;
pub mod migration;
pub mod observability;
pub mod route;
pub mod slots;
pub mod store;
pub mod version;
pub mod worker;
