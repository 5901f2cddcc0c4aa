//! In-memory message bus.

use super::MessageBus;
use async_trait::async_trait;
use slotway_core::{BusError, BusMessage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Default)]
struct Queue {
    messages: VecDeque<BusMessage>,
    /// Messages handed out by the last read and not yet acknowledged
    in_flight: usize,
}

/// FIFO bus held in process memory.
///
/// Unacknowledged messages stay at the head of the queue, so a read that is
/// not followed by `ack` is redelivered by the next read.
#[derive(Debug)]
pub struct MemoryMessageBus {
    name: String,
    queue: Mutex<Queue>,
    notify: Notify,
    open: AtomicBool,
    unavailable: AtomicBool,
    poll_timeout: Duration,
}

impl MemoryMessageBus {
    pub fn new(name: impl Into<String>, poll_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            queue: Mutex::new(Queue::default()),
            notify: Notify::new(),
            open: AtomicBool::new(true),
            unavailable: AtomicBool::new(false),
            poll_timeout,
        }
    }

    /// Simulate a transport outage: reads and writes fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages not yet acknowledged, including the in-flight batch.
    pub fn len(&self) -> usize {
        self.queue().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), BusError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(BusError::Closed(self.name.clone()));
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable {
                bus: self.name.clone(),
                reason: "transport unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn take_batch(&self, max: usize) -> Vec<BusMessage> {
        let mut queue = self.queue();
        let count = max.min(queue.messages.len());
        queue.in_flight = count;
        queue.messages.iter().take(count).cloned().collect()
    }
}

#[async_trait]
impl MessageBus for MemoryMessageBus {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<(), BusError> {
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.open.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn write_batch(&self, messages: Vec<BusMessage>) -> Result<(), BusError> {
        self.check_available()?;
        if messages.is_empty() {
            return Ok(());
        }
        let count = messages.len();
        self.queue().messages.extend(messages);
        self.notify.notify_one();
        trace!(bus = %self.name, count, "Messages written");
        Ok(())
    }

    async fn read(&self, max: usize) -> Result<Vec<BusMessage>, BusError> {
        self.check_available()?;
        let batch = self.take_batch(max);
        if !batch.is_empty() || max == 0 {
            return Ok(batch);
        }

        // Empty: wait for a writer or the poll timeout, then look once more.
        let _ = tokio::time::timeout(self.poll_timeout, self.notify.notified()).await;
        self.check_available()?;
        Ok(self.take_batch(max))
    }

    async fn ack(&self) -> Result<(), BusError> {
        self.check_available()?;
        let mut queue = self.queue();
        let count = queue.in_flight.min(queue.messages.len());
        queue.messages.drain(..count);
        queue.in_flight = 0;
        Ok(())
    }
}
