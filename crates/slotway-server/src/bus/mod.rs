//! Message Buses
//!
//! A message bus is a named, durable channel with at-least-once delivery.
//! Readers consume a batch with `read`, process it, then `ack` it; a batch that
//! is read again before being acknowledged is redelivered.
//!
//! ```text
//!   BusFactory ──open(kind, config)──▶ Arc<dyn MessageBus>
//!        │                                   │
//!   BusProvider ("memory", ...)        BusRegistry (name → bus)
//! ```
//!
//! Implementations are interchangeable behind the [`MessageBus`] trait; the
//! in-memory bus backs tests and single-process deployments.

mod factory;
mod memory;
mod registry;

pub use factory::{BusFactory, BusProvider, MemoryBusProvider, MEMORY_BUS};
pub use memory::MemoryMessageBus;
pub use registry::BusRegistry;

use async_trait::async_trait;
use slotway_core::{BusError, BusMessage};

/// Durable channel carrying [`BusMessage`]s.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Channel name
    fn name(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn open(&self) -> Result<(), BusError>;

    async fn close(&self) -> Result<(), BusError>;

    async fn write(&self, message: BusMessage) -> Result<(), BusError> {
        self.write_batch(vec![message]).await
    }

    /// Append messages in order; either all are accepted or none.
    async fn write_batch(&self, messages: Vec<BusMessage>) -> Result<(), BusError>;

    /// Read up to `max` messages, waiting at most the bus poll timeout when
    /// nothing is available.
    async fn read(&self, max: usize) -> Result<Vec<BusMessage>, BusError>;

    /// Read a batch and hand each message to `consumer`; returns the count.
    async fn read_with_consumer(
        &self,
        max: usize,
        consumer: &mut (dyn FnMut(BusMessage) + Send),
    ) -> Result<usize, BusError> {
        let batch = self.read(max).await?;
        let count = batch.len();
        for message in batch {
            consumer(message);
        }
        Ok(count)
    }

    /// Acknowledge the last batch returned by `read`.
    async fn ack(&self) -> Result<(), BusError>;
}
